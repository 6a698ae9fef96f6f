//! Shared state handed to every webhook handler.

use crate::conversation::ConversationRouter;
use std::sync::Arc;

pub struct ApiState {
    pub ctx: crate::AppContext,
    pub router: Arc<ConversationRouter>,
}

impl ApiState {
    pub fn new(ctx: crate::AppContext, router: Arc<ConversationRouter>) -> Arc<Self> {
        Arc::new(Self { ctx, router })
    }
}
