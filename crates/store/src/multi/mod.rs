//! Multi store - fan-out to an ordered list of children.
//!
//! Every child receives the whole batch. Because each child's residual is a
//! suffix of that same batch, aggregation is suffix arithmetic: under
//! SUCCESS_ALL the union of uncommitted work is the *longest* residual, and
//! under SUCCESS_ANY (where failure means every child failed) the
//! intersection is the *shortest* one.

use async_trait::async_trait;
use sluice_protocol::MessageBatch;

use crate::common::{Handled, StatusLine};
use crate::options::StoreOptions;
use crate::store::{create_store, Store, StoreContext};

const RECOGNIZED: &[&str] = &["report_success"];

/// When the fan-out counts as successful
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SuccessPolicy {
    /// At least one child committed the batch
    #[default]
    Any,

    /// Every child committed the batch
    All,
}

/// Store that replicates batches to N children
pub struct MultiStore {
    ctx: StoreContext,
    category: String,
    multi: bool,

    children: Vec<Box<dyn Store>>,
    policy: SuccessPolicy,
    saved_options: StoreOptions,
    config_error: Option<String>,
    status: StatusLine,
}

impl MultiStore {
    /// Create an unconfigured multi store
    pub fn new(ctx: StoreContext, category: &str, multi_category: bool) -> Self {
        Self {
            ctx,
            category: category.to_string(),
            multi: multi_category,
            children: Vec::new(),
            policy: SuccessPolicy::default(),
            saved_options: StoreOptions::new(),
            config_error: None,
            status: StatusLine::new(),
        }
    }

    /// Number of configured children
    pub fn child_count(&self) -> usize {
        self.children.len()
    }

    #[cfg(test)]
    pub(crate) fn set_children(&mut self, children: Vec<Box<dyn Store>>) {
        self.children = children;
    }
}

#[async_trait]
impl Store for MultiStore {
    fn category(&self) -> &str {
        &self.category
    }

    fn store_type(&self) -> &'static str {
        "multi"
    }

    fn multi_category(&self) -> bool {
        self.multi
    }

    fn configure(&mut self, options: &StoreOptions) {
        if let Some(policy) = options.get_str("report_success") {
            match policy.as_str() {
                "any" => self.policy = SuccessPolicy::Any,
                "all" => self.policy = SuccessPolicy::All,
                other => {
                    self.config_error = Some(format!("unknown report_success {other:?}"));
                }
            }
        }

        self.children.clear();
        let mut recognized: Vec<String> = RECOGNIZED.iter().map(|k| k.to_string()).collect();
        for index in 0.. {
            let key = format!("store{index}");
            let Some(section) = options.section(&key) else {
                break;
            };
            recognized.push(key);
            let child = section.get_str("type").and_then(|store_type| {
                let mut child = create_store(&self.ctx, &store_type, &self.category, self.multi)?;
                child.configure(section);
                Some(child)
            });
            match child {
                Some(child) => self.children.push(child),
                None => {
                    self.config_error = Some(format!("store{index} is unusable"));
                    break;
                }
            }
        }

        if self.children.is_empty() && self.config_error.is_none() {
            self.config_error = Some("multi store requires at least store0".into());
        }
        if let Some(message) = &self.config_error {
            self.status.set(format!("misconfigured: {message}"));
            tracing::error!(
                category = %self.category,
                error = %message,
                "multi store misconfigured"
            );
        }

        self.saved_options = options.clone();
        let recognized_refs: Vec<&str> = recognized.iter().map(|k| k.as_str()).collect();
        options.warn_unknown(&recognized_refs, self.store_type(), &self.category);
    }

    async fn open(&mut self) -> bool {
        if self.config_error.is_some() {
            return false;
        }
        let mut opened = Vec::with_capacity(self.children.len());
        for child in &mut self.children {
            opened.push(child.open().await);
        }
        match self.policy {
            SuccessPolicy::Any => opened.iter().any(|&ok| ok),
            SuccessPolicy::All => opened.iter().all(|&ok| ok),
        }
    }

    fn is_open(&self) -> bool {
        if self.children.is_empty() {
            return false;
        }
        match self.policy {
            SuccessPolicy::Any => self.children.iter().any(|c| c.is_open()),
            SuccessPolicy::All => self.children.iter().all(|c| c.is_open()),
        }
    }

    async fn close(&mut self) {
        for child in &mut self.children {
            child.close().await;
        }
    }

    async fn handle_messages(&mut self, batch: MessageBatch) -> Handled {
        if batch.is_empty() || self.children.is_empty() {
            return Handled::Complete;
        }

        let mut any_ok = false;
        let mut longest: MessageBatch = MessageBatch::new();
        let mut shortest: Option<MessageBatch> = None;

        for child in &mut self.children {
            match child.handle_messages(batch.clone()).await {
                Handled::Complete => {
                    any_ok = true;
                }
                Handled::Residual(rest) => {
                    if rest.len() > longest.len() {
                        longest = rest.clone();
                    }
                    if shortest.as_ref().map_or(true, |s| rest.len() < s.len()) {
                        shortest = Some(rest);
                    }
                }
            }
        }

        match self.policy {
            SuccessPolicy::Any => {
                if any_ok {
                    Handled::Complete
                } else {
                    Handled::Residual(shortest.unwrap_or(batch))
                }
            }
            SuccessPolicy::All => {
                if longest.is_empty() {
                    Handled::Complete
                } else {
                    Handled::Residual(longest)
                }
            }
        }
    }

    async fn periodic_check(&mut self) {
        for child in &mut self.children {
            child.periodic_check().await;
        }
    }

    async fn flush(&mut self) {
        for child in &mut self.children {
            child.flush().await;
        }
    }

    fn copy_for_category(&self, category: &str) -> Box<dyn Store> {
        let mut copy = MultiStore::new(self.ctx.clone(), category, self.multi);
        copy.configure(&self.saved_options);
        Box::new(copy)
    }

    fn status(&self) -> String {
        let own = self.status.get();
        if !own.is_empty() {
            return own;
        }
        // First unhealthy child speaks for the fan-out
        self.children
            .iter()
            .map(|c| c.status())
            .find(|s| !s.is_empty())
            .unwrap_or_default()
    }
}
