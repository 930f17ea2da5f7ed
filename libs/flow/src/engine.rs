//! The ordering state machine.
//!
//! One inbound message = one transition: load the snapshot, interpret the
//! input against the current state, persist the snapshot, enqueue the
//! replies. Replies stay FIFO per conversation because the queue sub-keys
//! on `{tenant, conversation}`.

use std::collections::BTreeMap;

use serde_json::json;
use thiserror::Error;
use time::OffsetDateTime;
use tracing::{info, warn};
use wg_core::bus::{emit, Event, EventKind, SharedBus};
use wg_core::catalog::SharedCatalog;
use wg_core::texts;
use wg_core::types::{
    DeliveryAddress, InboundPayload, OutboundJob, OrderType, TemplateIntent, Tenant,
};
use wg_store::{ConversationRow, NewOrder, Store, StoreError};

use crate::enqueue::SharedEnqueuer;
use crate::matchers::{self, CartChoice, MAX_QUANTITY};
use crate::state::{FlowRecord, FlowState, PendingItem};
use crate::submit::{OrderSubmission, OrderSubmitError, SharedOrderApi};

#[derive(Debug, Error)]
pub enum FlowError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("outbound enqueue failed: {0}")]
    Enqueue(#[source] anyhow::Error),
}

/// One inbound message in its resolved context.
pub struct InboundContext<'a> {
    pub tenant: &'a Tenant,
    pub conversation: &'a ConversationRow,
    pub payload: &'a InboundPayload,
    pub profile_name: Option<&'a str>,
    pub now: OffsetDateTime,
}

pub struct FlowEngine {
    store: Store,
    catalog: SharedCatalog,
    enqueuer: SharedEnqueuer,
    bus: SharedBus,
    order_api: SharedOrderApi,
}

impl FlowEngine {
    pub fn new(
        store: Store,
        catalog: SharedCatalog,
        enqueuer: SharedEnqueuer,
        bus: SharedBus,
        order_api: SharedOrderApi,
    ) -> Self {
        Self {
            store,
            catalog,
            enqueuer,
            bus,
            order_api,
        }
    }

    /// Applies one transition. Invalid input never advances state; it only
    /// produces a bounded reply.
    pub async fn handle_inbound(&self, ctx: InboundContext<'_>) -> Result<(), FlowError> {
        if !ctx.conversation.is_bot_active {
            return Ok(());
        }

        let mut record = FlowRecord::from_value(self.store.load_flow(&ctx.conversation.id).await?);
        if let Some(name) = ctx.profile_name {
            if !name.trim().is_empty() {
                record.customer_name = Some(name.trim().to_string());
            }
        }

        let token = payload_token(ctx.payload);
        let mut replies: Vec<String> = Vec::new();
        let mut welcome = false;

        if let Some(t) = token.as_deref() {
            // Handover is exited by explicit agent action only; a typed
            // trigger must not resume automation.
            if matchers::is_new_order(t)
                && record.state != FlowState::New
                && record.state != FlowState::Handover
            {
                record.reset();
            }
        }

        match record.state {
            FlowState::New => {
                welcome = true;
                record.state = FlowState::AwaitingType;
            }
            FlowState::AwaitingType => self.on_awaiting_type(&ctx, &mut record, &mut replies, token.as_deref()).await,
            FlowState::AwaitingLocation => {
                self.on_awaiting_location(&ctx, &mut record, &mut replies, token.as_deref())
                    .await
            }
            FlowState::AwaitingBranch => {
                self.on_awaiting_branch(&ctx, &mut record, &mut replies, token.as_deref())
                    .await
            }
            FlowState::BrowsingCategories => {
                self.on_browsing_categories(&ctx, &mut record, &mut replies, token.as_deref())
                    .await
            }
            FlowState::BrowsingItems => {
                self.on_browsing_items(&mut record, &mut replies, token.as_deref())
            }
            FlowState::AwaitingQuantity => {
                on_awaiting_quantity(&mut record, &mut replies, token.as_deref())
            }
            FlowState::CartOverview => {
                self.on_cart_overview(&ctx, &mut record, &mut replies, token.as_deref())
                    .await
            }
            FlowState::AwaitingRemoval => {
                on_awaiting_removal(ctx.tenant, &mut record, &mut replies, token.as_deref())
            }
            FlowState::Checkout => {
                self.checkout(ctx.tenant, &mut record, &mut replies);
            }
            FlowState::AwaitingPayment => {
                self.on_awaiting_payment(&ctx, &mut record, &mut replies, token.as_deref())
                    .await?
            }
            FlowState::OrderSubmitted | FlowState::Tracking => {
                self.on_tracking(&mut record, &mut replies).await?
            }
            FlowState::Handover => return Ok(()),
        }

        self.store
            .save_flow(&ctx.conversation.id, &record.to_value(), ctx.now)
            .await?;

        if welcome {
            self.enqueue(welcome_job(&ctx, &record)).await?;
        }
        for body in replies {
            self.enqueue(reply_job(&ctx, body)).await?;
        }
        Ok(())
    }

    async fn enqueue(&self, job: OutboundJob) -> Result<(), FlowError> {
        self.enqueuer.enqueue(job).await.map_err(FlowError::Enqueue)
    }

    async fn on_awaiting_type(
        &self,
        ctx: &InboundContext<'_>,
        record: &mut FlowRecord,
        replies: &mut Vec<String>,
        token: Option<&str>,
    ) {
        match token.and_then(matchers::parse_order_type) {
            Some(OrderType::Delivery) => {
                record.order_type = Some(OrderType::Delivery);
                record.state = FlowState::AwaitingLocation;
                replies.push(texts::ask_location());
            }
            Some(other) => {
                record.order_type = Some(other);
                match self.load_branches(ctx.tenant).await {
                    Some(branches) if !branches.is_empty() => {
                        let listed: Vec<(String, String)> = branches
                            .iter()
                            .map(|b| (b.id.clone(), b.name.clone()))
                            .collect();
                        record.branch_options = branches;
                        record.state = FlowState::AwaitingBranch;
                        replies.push(texts::branch_list(&listed));
                    }
                    _ => replies.push(texts::menu_unavailable()),
                }
            }
            None => replies.push(texts::ask_order_type_again()),
        }
    }

    async fn on_awaiting_location(
        &self,
        ctx: &InboundContext<'_>,
        record: &mut FlowRecord,
        replies: &mut Vec<String>,
        token: Option<&str>,
    ) {
        let coords = match ctx.payload {
            InboundPayload::Location {
                latitude,
                longitude,
                address,
            } => Some((*latitude, *longitude, address.clone())),
            _ => token
                .and_then(matchers::parse_lat_lng)
                .map(|(lat, lng)| (lat, lng, None)),
        };
        match coords {
            Some((latitude, longitude, address)) => {
                record.address = Some(DeliveryAddress {
                    latitude,
                    longitude,
                    address: address.unwrap_or_else(|| format!("{latitude},{longitude}")),
                });
                self.browse_categories(ctx.tenant, record, replies).await;
            }
            None => replies.push(texts::location_not_understood()),
        }
    }

    async fn on_awaiting_branch(
        &self,
        ctx: &InboundContext<'_>,
        record: &mut FlowRecord,
        replies: &mut Vec<String>,
        token: Option<&str>,
    ) {
        let Some(t) = token else {
            replies.push(texts::generic_invalid_input());
            return;
        };
        let picked = matchers::pick_option(
            t,
            "branch_",
            &record.branch_options,
            |b| &b.id,
            |b| &b.name,
        )
        .cloned();
        match picked {
            Some(branch) => {
                record.branch = Some(branch);
                self.browse_categories(ctx.tenant, record, replies).await;
            }
            None => {
                let listed: Vec<(String, String)> = record
                    .branch_options
                    .iter()
                    .map(|b| (b.id.clone(), b.name.clone()))
                    .collect();
                replies.push(texts::branch_list(&listed));
            }
        }
    }

    async fn on_browsing_categories(
        &self,
        ctx: &InboundContext<'_>,
        record: &mut FlowRecord,
        replies: &mut Vec<String>,
        token: Option<&str>,
    ) {
        if record.category_options.is_empty() {
            self.browse_categories(ctx.tenant, record, replies).await;
            return;
        }
        let Some(t) = token else {
            replies.push(texts::generic_invalid_input());
            return;
        };
        let picked = matchers::pick_option(
            t,
            "cat_",
            &record.category_options,
            |c| &c.id,
            |c| &c.name,
        )
        .cloned();
        let Some(category) = picked else {
            let listed: Vec<(String, String)> = record
                .category_options
                .iter()
                .map(|c| (c.id.clone(), c.name.clone()))
                .collect();
            replies.push(texts::category_list(&listed));
            return;
        };

        let merchant = ctx.tenant.merchant_id.as_deref().unwrap_or_default();
        match self.catalog.items(merchant, &category.id).await {
            Ok(items) if !items.is_empty() => {
                let listed: Vec<(String, String, i64)> = items
                    .iter()
                    .map(|i| (i.id.clone(), i.name.clone(), i.price_minor))
                    .collect();
                replies.push(texts::item_list(&category.name, &listed, &ctx.tenant.currency));
                record.item_options = items;
                record.current_category = Some(category);
                record.state = FlowState::BrowsingItems;
            }
            Ok(_) => replies.push(texts::no_items_in_category(&category.name)),
            Err(err) => {
                warn!(error = %err, tenant = %ctx.tenant.id, "item fetch failed");
                replies.push(texts::menu_unavailable());
            }
        }
    }

    fn on_browsing_items(
        &self,
        record: &mut FlowRecord,
        replies: &mut Vec<String>,
        token: Option<&str>,
    ) {
        let Some(t) = token else {
            replies.push(texts::generic_invalid_input());
            return;
        };
        let picked =
            matchers::pick_option(t, "item_", &record.item_options, |i| &i.id, |i| &i.name)
                .cloned();
        match picked {
            Some(item) => {
                replies.push(texts::ask_quantity(&item.name, MAX_QUANTITY));
                record.pending = Some(PendingItem { item });
                record.state = FlowState::AwaitingQuantity;
            }
            None => replies.push(texts::generic_invalid_input()),
        }
    }

    async fn on_cart_overview(
        &self,
        ctx: &InboundContext<'_>,
        record: &mut FlowRecord,
        replies: &mut Vec<String>,
        token: Option<&str>,
    ) {
        match token.and_then(matchers::parse_cart_choice) {
            Some(CartChoice::Add) => self.browse_categories(ctx.tenant, record, replies).await,
            Some(CartChoice::Remove) => {
                if record.cart.is_empty() {
                    replies.push(texts::empty_cart());
                } else {
                    replies.push(texts::ask_removal(&record.cart));
                    record.state = FlowState::AwaitingRemoval;
                }
            }
            Some(CartChoice::View) | None => {
                replies.push(texts::cart_summary(
                    &record.cart,
                    record.cart_total_minor(),
                    &ctx.tenant.currency,
                ));
            }
            Some(CartChoice::Checkout) => self.checkout(ctx.tenant, record, replies),
        }
    }

    /// Validates the cart and, when complete, emits the summary plus payment
    /// options.
    fn checkout(&self, tenant: &Tenant, record: &mut FlowRecord, replies: &mut Vec<String>) {
        if record.cart.is_empty() {
            record.state = FlowState::CartOverview;
            replies.push(texts::empty_cart());
            return;
        }
        let order_type = record.order_type.unwrap_or(OrderType::Delivery);
        if order_type.needs_address() && record.address.is_none() {
            record.state = FlowState::AwaitingLocation;
            replies.push(texts::missing_address());
            return;
        }
        if !order_type.needs_address() && record.branch.is_none() {
            record.state = FlowState::AwaitingBranch;
            replies.push(texts::missing_branch());
            return;
        }
        let destination = match (&record.address, &record.branch) {
            (Some(addr), _) if order_type.needs_address() => addr.address.clone(),
            (_, Some(branch)) => branch.name.clone(),
            _ => String::new(),
        };
        replies.push(texts::checkout_summary(
            &record.cart,
            record.cart_total_minor(),
            &tenant.currency,
            order_type,
            &destination,
        ));
        record.state = FlowState::AwaitingPayment;
    }

    async fn on_awaiting_payment(
        &self,
        ctx: &InboundContext<'_>,
        record: &mut FlowRecord,
        replies: &mut Vec<String>,
        token: Option<&str>,
    ) -> Result<(), FlowError> {
        let Some(payment) = token.and_then(matchers::parse_payment) else {
            replies.push(texts::ask_payment_again());
            return Ok(());
        };
        let Some(merchant_id) = ctx.tenant.merchant_id.clone() else {
            warn!(tenant = %ctx.tenant.id, code = OrderSubmitError::MerchantNotConfigured.code(), "order submit refused");
            replies.push(texts::order_submit_failed());
            return Ok(());
        };

        let order_type = record.order_type.unwrap_or(OrderType::Delivery);
        let submission = OrderSubmission {
            merchant_id,
            order_type,
            items: record.cart.clone(),
            total_minor: record.cart_total_minor(),
            currency: ctx.tenant.currency.clone(),
            customer_wa: ctx.conversation.customer_wa.clone(),
            customer_name: record.customer_name.clone(),
            address: record.address.clone(),
            branch: record.branch.clone(),
            payment_method: payment,
        };

        let draft = self
            .store
            .insert_order(NewOrder {
                conversation_id: ctx.conversation.id.clone(),
                tenant_id: ctx.tenant.id.clone(),
                order_type,
                items: submission.items.clone(),
                total_minor: submission.total_minor,
                currency: submission.currency.clone(),
                address: submission.address.clone(),
                branch: submission.branch.clone(),
                payment_method: None,
                at: ctx.now,
            })
            .await?;

        match self.order_api.submit(&submission).await {
            Ok(order_no) => {
                let confirmed = self
                    .store
                    .confirm_order(&draft.id, &order_no, payment, ctx.now)
                    .await?;
                record.last_order_id = Some(confirmed.id.clone());
                record.state = FlowState::OrderSubmitted;
                replies.push(texts::order_submitted(&order_no));
                info!(tenant = %ctx.tenant.id, order = %confirmed.id, external = %order_no, "order submitted");
                metrics::counter!("orders_submitted", "tenant" => ctx.tenant.id.clone())
                    .increment(1);
                emit(
                    self.bus.as_ref(),
                    Event::new(
                        EventKind::OrderUpdated,
                        &ctx.tenant.id,
                        json!({
                            "orderId": confirmed.id,
                            "externalNo": order_no,
                            "status": confirmed.status.as_str(),
                        }),
                    ),
                )
                .await;
            }
            Err(err) => {
                warn!(tenant = %ctx.tenant.id, code = err.code(), error = %err, "order submit failed");
                replies.push(match err {
                    OrderSubmitError::NoBranchSelected => texts::missing_branch(),
                    OrderSubmitError::CustomerInfoMissing => texts::missing_address(),
                    OrderSubmitError::InvalidItems => texts::empty_cart(),
                    OrderSubmitError::MissingPaymentMethod => texts::ask_payment_again(),
                    OrderSubmitError::ApiError(_)
                    | OrderSubmitError::ConfigMissing
                    | OrderSubmitError::MerchantNotConfigured => texts::order_submit_failed(),
                });
            }
        }
        Ok(())
    }

    async fn on_tracking(
        &self,
        record: &mut FlowRecord,
        replies: &mut Vec<String>,
    ) -> Result<(), FlowError> {
        let Some(order_id) = record.last_order_id.clone() else {
            replies.push(texts::generic_invalid_input());
            return Ok(());
        };
        match self.store.order_by_id(&order_id).await? {
            Some(order) => {
                let no = order.external_no.unwrap_or_else(|| order.id.clone());
                replies.push(texts::order_status_update(
                    &no,
                    &texts::status_line(order.status),
                ));
                record.state = FlowState::Tracking;
            }
            None => replies.push(texts::generic_invalid_input()),
        }
        Ok(())
    }

    async fn browse_categories(
        &self,
        tenant: &Tenant,
        record: &mut FlowRecord,
        replies: &mut Vec<String>,
    ) {
        let Some(merchant) = tenant.merchant_id.as_deref() else {
            replies.push(texts::menu_unavailable());
            return;
        };
        match self.catalog.categories(merchant).await {
            Ok(categories) if !categories.is_empty() => {
                let listed: Vec<(String, String)> = categories
                    .iter()
                    .map(|c| (c.id.clone(), c.name.clone()))
                    .collect();
                record.category_options = categories;
                record.state = FlowState::BrowsingCategories;
                replies.push(texts::category_list(&listed));
            }
            Ok(_) => replies.push(texts::menu_unavailable()),
            Err(err) => {
                warn!(error = %err, tenant = %tenant.id, "category fetch failed");
                // Stay browsable: the next input retries the fetch.
                record.state = FlowState::BrowsingCategories;
                record.category_options.clear();
                replies.push(texts::menu_unavailable());
            }
        }
    }

    async fn load_branches(&self, tenant: &Tenant) -> Option<Vec<wg_core::types::BranchRef>> {
        let merchant = tenant.merchant_id.as_deref()?;
        match self.catalog.branches(merchant).await {
            Ok(branches) => Some(branches),
            Err(err) => {
                warn!(error = %err, tenant = %tenant.id, "branch fetch failed");
                None
            }
        }
    }
}

fn on_awaiting_quantity(record: &mut FlowRecord, replies: &mut Vec<String>, token: Option<&str>) {
    match token.and_then(matchers::parse_quantity) {
        Some(q) if matchers::quantity_in_bounds(q) => {
            if let Some(line) = record.commit_pending(q) {
                replies.push(texts::item_added(&line.name, q));
                record.state = FlowState::CartOverview;
            } else {
                replies.push(texts::generic_invalid_input());
                record.state = FlowState::CartOverview;
            }
        }
        _ => replies.push(texts::quantity_out_of_bounds(MAX_QUANTITY)),
    }
}

fn on_awaiting_removal(
    tenant: &Tenant,
    record: &mut FlowRecord,
    replies: &mut Vec<String>,
    token: Option<&str>,
) {
    let Some(t) = token else {
        replies.push(texts::removal_not_found());
        return;
    };
    match matchers::pick_removal(t, &record.cart) {
        Some(idx) => {
            let removed = record.cart.remove(idx);
            replies.push(texts::item_removed(&removed.name));
            replies.push(texts::cart_summary(
                &record.cart,
                record.cart_total_minor(),
                &tenant.currency,
            ));
            record.state = FlowState::CartOverview;
        }
        None => replies.push(texts::removal_not_found()),
    }
}

fn payload_token(payload: &InboundPayload) -> Option<String> {
    match payload {
        InboundPayload::Text { body } | InboundPayload::Interactive { body } => {
            Some(body.trim().to_string())
        }
        InboundPayload::Button { payload, .. } => Some(payload.trim().to_string()),
        InboundPayload::Media { caption, .. } => caption.clone(),
        InboundPayload::Location { .. } => None,
    }
}

fn reply_job(ctx: &InboundContext<'_>, body: String) -> OutboundJob {
    OutboundJob::text(
        ctx.tenant.id.clone(),
        ctx.conversation.id.clone(),
        ctx.conversation.customer_wa.clone(),
        ctx.tenant.wa_number.clone(),
        body,
    )
}

/// The welcome is an explicit template send: variables carry the customer
/// display name and the restaurant name.
fn welcome_job(ctx: &InboundContext<'_>, record: &FlowRecord) -> OutboundJob {
    let name = record
        .customer_name
        .clone()
        .unwrap_or_else(|| "عميلنا العزيز".into());
    let mut vars = BTreeMap::new();
    vars.insert("1".to_string(), name.clone());
    vars.insert("2".to_string(), ctx.tenant.name.clone());

    let mut job = reply_job(ctx, texts::welcome(&ctx.tenant.name, &name));
    job.intent = TemplateIntent::Welcome;
    job.template_variables = Some(vars);
    job
}
