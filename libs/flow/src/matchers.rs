//! Input interpretation: explicit id tokens first, then free text.
//!
//! Interactive replies carry stable prefixes (`cat_`, `item_`, `branch_`,
//! `qty_`, `pay_`, `remove_item_`); plain text falls back to numbered
//! choices, names, and keywords. Arabic-Indic digits are accepted wherever
//! a number is.

use once_cell::sync::Lazy;
use regex::Regex;
use wg_core::types::{OrderType, PaymentMethod};

/// Maximum quantity per cart line.
pub const MAX_QUANTITY: u32 = 20;

/// Flow-reset trigger, matched before any state handling.
pub fn is_new_order(text: &str) -> bool {
    let t = text.trim();
    t.eq_ignore_ascii_case("new_order") || t == "طلب جديد" || t == "ابدأ من جديد"
}

/// Replaces Arabic-Indic digits with ASCII ones.
pub fn normalize_digits(text: &str) -> String {
    text.chars()
        .map(|c| match c {
            '٠'..='٩' => char::from(b'0' + (c as u32 - '٠' as u32) as u8),
            _ => c,
        })
        .collect()
}

/// 1-based list choice within `len`, from plain or Arabic-Indic digits.
pub fn parse_index(text: &str, len: usize) -> Option<usize> {
    let n: usize = normalize_digits(text.trim()).parse().ok()?;
    if n >= 1 && n <= len {
        Some(n - 1)
    } else {
        None
    }
}

/// Quantity from free text or a `qty_*` token. Returns the raw number so
/// the caller can produce a bounded error for out-of-range values.
pub fn parse_quantity(text: &str) -> Option<u32> {
    let t = normalize_digits(text.trim());
    let t = t.strip_prefix("qty_").unwrap_or(&t);
    t.parse().ok()
}

pub fn quantity_in_bounds(quantity: u32) -> bool {
    (1..=MAX_QUANTITY).contains(&quantity)
}

pub fn parse_order_type(text: &str) -> Option<OrderType> {
    let lower = text.trim().to_lowercase();
    let t = normalize_digits(&lower);
    match t.as_str() {
        "1" | "delivery" | "توصيل" => Some(OrderType::Delivery),
        "2" | "pickup" | "takeaway" | "استلام" | "استلام من الفرع" | "فرع" => {
            Some(OrderType::Takeaway)
        }
        "dine_in" | "في المطعم" => Some(OrderType::DineIn),
        "from_car" | "من السيارة" => Some(OrderType::FromCar),
        _ => None,
    }
}

pub fn parse_payment(text: &str) -> Option<PaymentMethod> {
    let lower = text.trim().to_lowercase();
    let t = normalize_digits(&lower);
    match t.as_str() {
        "1" | "pay_online" | "online" | "دفع إلكتروني" | "الكتروني" => {
            Some(PaymentMethod::Online)
        }
        "2" | "pay_cash" | "cash" | "كاش" | "نقدي" | "كاش عند الاستلام" => {
            Some(PaymentMethod::Cash)
        }
        _ => None,
    }
}

/// Picks from `options` by explicit `{prefix}{id}` token, then 1-based
/// index, then exact name, then substring. Ids win over text.
pub fn pick_option<'a, T>(
    text: &str,
    prefix: &str,
    options: &'a [T],
    id_of: impl Fn(&T) -> &str,
    name_of: impl Fn(&T) -> &str,
) -> Option<&'a T> {
    let t = text.trim();
    if let Some(id) = t.strip_prefix(prefix) {
        if let Some(found) = options.iter().find(|&o| {
            let full = id_of(o);
            full == t || full.strip_prefix(prefix) == Some(id)
        }) {
            return Some(found);
        }
    }
    if let Some(idx) = parse_index(t, options.len()) {
        return Some(&options[idx]);
    }
    if let Some(exact) = options.iter().find(|&o| name_of(o).trim() == t) {
        return Some(exact);
    }
    options
        .iter()
        .find(|&o| name_of(o).contains(t) && !t.is_empty())
}

static LAT_LNG: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^\s*(-?\d{1,3}(?:\.\d+)?)\s*,\s*(-?\d{1,3}(?:\.\d+)?)\s*$")
        .expect("lat/lng pattern compiles")
});

/// Fallback for customers who type coordinates instead of sharing location.
pub fn parse_lat_lng(text: &str) -> Option<(f64, f64)> {
    let normalized = normalize_digits(text);
    let caps = LAT_LNG.captures(&normalized)?;
    let lat: f64 = caps.get(1)?.as_str().parse().ok()?;
    let lng: f64 = caps.get(2)?.as_str().parse().ok()?;
    if (-90.0..=90.0).contains(&lat) && (-180.0..=180.0).contains(&lng) {
        Some((lat, lng))
    } else {
        None
    }
}

/// Cart-overview menu choices.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CartChoice {
    Add,
    Remove,
    View,
    Checkout,
}

pub fn parse_cart_choice(text: &str) -> Option<CartChoice> {
    let lower = text.trim().to_lowercase();
    let t = normalize_digits(&lower);
    match t.as_str() {
        "1" | "add" | "إضافة" | "إضافة أصناف" | "اضافة" => Some(CartChoice::Add),
        "2" | "remove" | "حذف" | "حذف صنف" => Some(CartChoice::Remove),
        "view" | "عرض" | "عرض السلة" | "سلة" => Some(CartChoice::View),
        "3" | "checkout" | "إتمام" | "إتمام الطلب" | "اتمام" => Some(CartChoice::Checkout),
        _ => None,
    }
}

/// Removal target: `remove_item_*` token, index, exact name, substring, in
/// that precedence. Returns the cart index.
pub fn pick_removal(text: &str, cart: &[wg_core::types::OrderItem]) -> Option<usize> {
    let t = text.trim();
    if let Some(id) = t.strip_prefix("remove_item_") {
        if let Some(pos) = cart.iter().position(|l| l.item_id == id || l.item_id == t) {
            return Some(pos);
        }
    }
    if let Some(idx) = parse_index(t, cart.len()) {
        return Some(idx);
    }
    if let Some(pos) = cart.iter().position(|l| l.name.trim() == t) {
        return Some(pos);
    }
    if t.is_empty() {
        return None;
    }
    cart.iter().position(|l| l.name.contains(t))
}

#[cfg(test)]
mod tests {
    use super::*;
    use wg_core::catalog::MenuCategory;
    use wg_core::types::OrderItem;

    fn cart() -> Vec<OrderItem> {
        vec![
            OrderItem {
                item_id: "item_1".into(),
                name: "برجر دجاج".into(),
                quantity: 1,
                unit_price_minor: 1500,
            },
            OrderItem {
                item_id: "item_2".into(),
                name: "بيبسي".into(),
                quantity: 2,
                unit_price_minor: 500,
            },
        ]
    }

    #[test]
    fn arabic_digits_normalize() {
        assert_eq!(normalize_digits("٣"), "3");
        assert_eq!(parse_quantity("٥"), Some(5));
        assert_eq!(parse_index("٢", 3), Some(1));
    }

    #[test]
    fn quantity_bounds() {
        assert!(!quantity_in_bounds(0));
        assert!(quantity_in_bounds(1));
        assert!(quantity_in_bounds(MAX_QUANTITY));
        assert!(!quantity_in_bounds(MAX_QUANTITY + 1));
        assert_eq!(parse_quantity("qty_4"), Some(4));
    }

    #[test]
    fn order_type_keywords() {
        assert_eq!(parse_order_type("توصيل"), Some(OrderType::Delivery));
        assert_eq!(parse_order_type("1"), Some(OrderType::Delivery));
        assert_eq!(parse_order_type("pickup"), Some(OrderType::Takeaway));
        assert_eq!(parse_order_type("مشويات"), None);
    }

    #[test]
    fn explicit_id_beats_text_match() {
        let options = vec![
            MenuCategory {
                id: "cat_1".into(),
                name: "1".into(),
            },
            MenuCategory {
                id: "cat_2".into(),
                name: "مشويات".into(),
            },
        ];
        let picked = pick_option("cat_2", "cat_", &options, |c| &c.id, |c| &c.name).unwrap();
        assert_eq!(picked.id, "cat_2");

        let by_index = pick_option("2", "cat_", &options, |c| &c.id, |c| &c.name).unwrap();
        assert_eq!(by_index.id, "cat_2");

        let by_name = pick_option("مشويات", "cat_", &options, |c| &c.id, |c| &c.name).unwrap();
        assert_eq!(by_name.id, "cat_2");
    }

    #[test]
    fn removal_precedence_index_then_exact_then_substring() {
        let cart = cart();
        assert_eq!(pick_removal("remove_item_2", &cart), Some(1));
        assert_eq!(pick_removal("1", &cart), Some(0));
        assert_eq!(pick_removal("بيبسي", &cart), Some(1));
        assert_eq!(pick_removal("برجر", &cart), Some(0));
        assert_eq!(pick_removal("شاورما", &cart), None);
    }

    #[test]
    fn lat_lng_fallback() {
        assert_eq!(parse_lat_lng("24.7136, 46.6753"), Some((24.7136, 46.6753)));
        assert_eq!(parse_lat_lng("٢٤.٧, ٤٦.٦"), Some((24.7, 46.6)));
        assert_eq!(parse_lat_lng("hello"), None);
        assert_eq!(parse_lat_lng("99, 200"), None);
    }

    #[test]
    fn new_order_trigger() {
        assert!(is_new_order("new_order"));
        assert!(is_new_order("طلب جديد"));
        assert!(!is_new_order("hello"));
    }
}
