//! Fixed catalog of user-facing texts (Arabic).
//!
//! Every message a customer can receive is assembled here; raw provider or
//! persistence errors never leak into a chat.

use crate::types::{OrderItem, OrderType};

pub fn welcome(restaurant: &str, customer: &str) -> String {
    let name = if customer.trim().is_empty() {
        "عميلنا العزيز"
    } else {
        customer
    };
    format!(
        "أهلاً {name} 👋\nمرحباً بك في {restaurant}!\nكيف تحب تستلم طلبك؟\n\n1️⃣ توصيل 🛵\n2️⃣ استلام من الفرع 🏬"
    )
}

pub fn ask_location() -> String {
    "ممتاز! 🛵\nفضلاً شارك موقعك الحالي عبر واتساب حتى نوصل طلبك بدقة 📍".into()
}

pub fn branch_list(branches: &[(String, String)]) -> String {
    let mut out = String::from("اختر الفرع الأقرب لك 🏬\n");
    for (i, (_, name)) in branches.iter().enumerate() {
        out.push_str(&format!("\n{}. {}", i + 1, name));
    }
    out.push_str("\n\nأرسل رقم الفرع أو اسمه.");
    out
}

pub fn category_list(categories: &[(String, String)]) -> String {
    let mut out = String::from("تفضل قائمتنا 📋 اختر القسم:\n");
    for (i, (_, name)) in categories.iter().enumerate() {
        out.push_str(&format!("\n{}. {}", i + 1, name));
    }
    out
}

pub fn item_list(category: &str, items: &[(String, String, i64)], currency: &str) -> String {
    let mut out = format!("أصناف {category} 🍽️:\n");
    for (i, (_, name, price_minor)) in items.iter().enumerate() {
        out.push_str(&format!(
            "\n{}. {} — {} {}",
            i + 1,
            name,
            format_minor(*price_minor),
            currency
        ));
    }
    out.push_str("\n\nأرسل رقم الصنف لإضافته.");
    out
}

pub fn ask_quantity(item: &str, max: u32) -> String {
    format!("كم الكمية من {item}؟ (1 إلى {max})")
}

pub fn quantity_out_of_bounds(max: u32) -> String {
    format!("عذراً، الكمية يجب أن تكون بين 1 و {max}. جرب مرة أخرى 🙏")
}

pub fn item_added(item: &str, quantity: u32) -> String {
    format!(
        "تمت إضافة {quantity} × {item} إلى سلتك ✅\n\nماذا تريد الآن؟\n1️⃣ إضافة أصناف أخرى\n2️⃣ عرض السلة\n3️⃣ إتمام الطلب"
    )
}

pub fn cart_summary(items: &[OrderItem], total_minor: i64, currency: &str) -> String {
    if items.is_empty() {
        return empty_cart();
    }
    let mut out = String::from("سلتك 🛒:\n");
    for (i, item) in items.iter().enumerate() {
        out.push_str(&format!(
            "\n{}. {} × {} = {} {}",
            i + 1,
            item.name,
            item.quantity,
            format_minor(item.line_total_minor()),
            currency
        ));
    }
    out.push_str(&format!(
        "\n\nالإجمالي: {} {}\n\n1️⃣ إضافة أصناف\n2️⃣ حذف صنف\n3️⃣ إتمام الطلب",
        format_minor(total_minor),
        currency
    ));
    out
}

pub fn empty_cart() -> String {
    "سلتك فارغة حالياً 🛒 أرسل \"قائمة\" لتصفح الأصناف.".into()
}

pub fn ask_removal(items: &[OrderItem]) -> String {
    let mut out = String::from("أي صنف تريد حذفه؟\n");
    for (i, item) in items.iter().enumerate() {
        out.push_str(&format!("\n{}. {} × {}", i + 1, item.name, item.quantity));
    }
    out.push_str("\n\nأرسل رقم الصنف أو اسمه.");
    out
}

pub fn item_removed(item: &str) -> String {
    format!("تم حذف {item} من سلتك ✅")
}

pub fn removal_not_found() -> String {
    "لم أجد هذا الصنف في سلتك. أرسل رقم الصنف أو اسمه كما يظهر في القائمة 🙏".into()
}

pub fn checkout_summary(
    items: &[OrderItem],
    total_minor: i64,
    currency: &str,
    order_type: OrderType,
    destination: &str,
) -> String {
    let mut out = String::from("ملخص طلبك ✅\n");
    for item in items {
        out.push_str(&format!("\n• {} × {}", item.name, item.quantity));
    }
    let how = match order_type {
        OrderType::Delivery => "توصيل إلى",
        _ => "استلام من",
    };
    out.push_str(&format!(
        "\n\nالإجمالي: {} {}\n{how}: {destination}\n\nاختر طريقة الدفع:\n1️⃣ دفع إلكتروني 💳\n2️⃣ كاش عند الاستلام 💵",
        format_minor(total_minor),
        currency
    ));
    out
}

pub fn order_submitted(order_no: &str) -> String {
    format!("تم استلام طلبك بنجاح 🎉\nرقم الطلب: {order_no}\nسنوافيك بتحديثات حالة الطلب أولاً بأول.")
}

pub fn order_status_update(order_no: &str, status_line: &str) -> String {
    format!("تحديث طلبك رقم {order_no}: {status_line}")
}

pub fn ask_order_type_again() -> String {
    "فضلاً اختر طريقة الاستلام:\n1️⃣ توصيل 🛵\n2️⃣ استلام من الفرع 🏬".into()
}

pub fn location_not_understood() -> String {
    "لم أتمكن من قراءة الموقع 📍 فضلاً استخدم زر مشاركة الموقع في واتساب.".into()
}

pub fn generic_invalid_input() -> String {
    "عذراً، لم أفهم طلبك 🙏 أرسل \"طلب جديد\" للبدء من جديد.".into()
}

pub fn cached_order_unavailable() -> String {
    "عذراً، تفاصيل الطلب لم تعد متوفرة ⏱️ تواصل مع خدمة العملاء وسنساعدك فوراً.".into()
}

pub fn order_submit_failed() -> String {
    "تعذر إرسال طلبك حالياً 😔 جرب مرة أخرى بعد قليل أو اختر طريقة دفع مختلفة.".into()
}

pub fn missing_branch() -> String {
    "فضلاً اختر الفرع أولاً حتى نكمل طلبك 🏬".into()
}

pub fn missing_address() -> String {
    "فضلاً شارك موقعك أولاً حتى نكمل طلبك 📍".into()
}

pub fn menu_unavailable() -> String {
    "عذراً، القائمة غير متوفرة حالياً 😔 جرب مرة أخرى بعد قليل.".into()
}

pub fn no_items_in_category(category: &str) -> String {
    format!("لا توجد أصناف متاحة في {category} حالياً. اختر قسماً آخر 🙏")
}

pub fn ask_payment_again() -> String {
    "فضلاً اختر طريقة الدفع:\n1️⃣ دفع إلكتروني 💳\n2️⃣ كاش عند الاستلام 💵".into()
}

/// Customer-facing line for each order status.
pub fn status_line(status: crate::types::OrderStatus) -> String {
    use crate::types::OrderStatus;
    match status {
        OrderStatus::Draft => "بانتظار التأكيد ⏳",
        OrderStatus::Confirmed => "تم تأكيد طلبك ✅",
        OrderStatus::Preparing => "طلبك قيد التحضير 👨‍🍳",
        OrderStatus::OutForDelivery => "طلبك في الطريق إليك 🛵",
        OrderStatus::Delivered => "تم توصيل طلبك، بالهناء والشفاء 🎉",
        OrderStatus::Rated => "شكراً لتقييمك 🌟",
        OrderStatus::Cancelled => "تم إلغاء الطلب ❌",
    }
    .into()
}

fn format_minor(minor: i64) -> String {
    let whole = minor / 100;
    let frac = (minor % 100).abs();
    if frac == 0 {
        format!("{whole}")
    } else {
        format!("{whole}.{frac:02}")
    }
}
