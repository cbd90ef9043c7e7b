//! Category store - one child store per seen category.
//!
//! Holds a configured-but-never-opened model store. The first message for
//! an unseen category materializes a child via `copy_for_category` and opens
//! it; later batches are grouped by category and forwarded. The multifile
//! variants only pin which model type gets built.

use std::collections::HashMap;

use async_trait::async_trait;
use sluice_protocol::MessageBatch;

use crate::common::{Handled, StatusLine};
use crate::file::FileStore;
use crate::framed::FramedFileStore;
use crate::options::StoreOptions;
use crate::store::Store;

/// Store that demultiplexes batches into per-category children
pub struct CategoryStore {
    category: String,
    store_type_name: &'static str,

    model: Option<Box<dyn Store>>,
    children: HashMap<String, Box<dyn Store>>,
    config_error: Option<String>,
    status: StatusLine,
}

impl CategoryStore {
    /// Category store whose children are plain file stores
    pub fn multi_file(category: &str, _multi_category: bool) -> Self {
        Self::with_model(category, "multifile")
    }

    /// Category store whose children are framed file stores
    pub fn framed_multi_file(category: &str, _multi_category: bool) -> Self {
        Self::with_model(category, "framed_multifile")
    }

    fn with_model(category: &str, store_type_name: &'static str) -> Self {
        Self {
            category: category.to_string(),
            store_type_name,
            model: None,
            children: HashMap::new(),
            config_error: None,
            status: StatusLine::new(),
        }
    }

    /// Categories with a materialized child
    pub fn materialized(&self) -> Vec<String> {
        let mut names: Vec<String> = self.children.keys().cloned().collect();
        names.sort();
        names
    }

    /// Child for a category, created from the model on first sight
    async fn child_for(&mut self, category: &str) -> Option<&mut Box<dyn Store>> {
        if !self.children.contains_key(category) {
            let model = self.model.as_ref()?;
            let mut child = model.copy_for_category(category);
            if !child.open().await {
                tracing::error!(
                    parent = %self.category,
                    category,
                    status = child.status(),
                    "failed to open category child"
                );
                return None;
            }
            tracing::info!(
                parent = %self.category,
                category,
                "materialized category store"
            );
            self.children.insert(category.to_string(), child);
        }
        self.children.get_mut(category)
    }
}

#[async_trait]
impl Store for CategoryStore {
    fn category(&self) -> &str {
        &self.category
    }

    fn store_type(&self) -> &'static str {
        self.store_type_name
    }

    fn multi_category(&self) -> bool {
        // Demultiplexing is the whole point
        true
    }

    fn configure(&mut self, options: &StoreOptions) {
        // The model consumes the same option set; children copy it. Each
        // child is bound to exactly one category, so they are not
        // multi-category themselves.
        let mut model: Box<dyn Store> = match self.store_type_name {
            "framed_multifile" => Box::new(FramedFileStore::new(&self.category, false)),
            _ => Box::new(FileStore::new(&self.category, false)),
        };
        model.configure(options);
        if !model.status().is_empty() {
            self.config_error = Some(format!("model store unusable: {}", model.status()));
            self.status
                .set(format!("misconfigured: {}", self.config_error.as_deref().unwrap_or("")));
            tracing::error!(
                category = %self.category,
                error = %model.status(),
                "category store misconfigured"
            );
        }
        self.model = Some(model);
    }

    async fn open(&mut self) -> bool {
        // Children open lazily as categories appear
        self.model.is_some() && self.config_error.is_none()
    }

    fn is_open(&self) -> bool {
        self.model.is_some() && self.config_error.is_none()
    }

    async fn close(&mut self) {
        for (_, child) in self.children.iter_mut() {
            child.close().await;
        }
        self.children.clear();
    }

    async fn handle_messages(&mut self, batch: MessageBatch) -> Handled {
        if batch.is_empty() {
            return Handled::Complete;
        }

        // Group by category, preserving order within each group
        let mut order: Vec<String> = Vec::new();
        let mut groups: HashMap<String, MessageBatch> = HashMap::new();
        for entry in batch {
            if !groups.contains_key(&entry.category) {
                order.push(entry.category.clone());
            }
            groups.entry(entry.category.clone()).or_default().push(entry);
        }

        let mut residual = MessageBatch::new();
        for category in order {
            let Some(group) = groups.remove(&category) else {
                continue;
            };
            match self.child_for(&category).await {
                Some(child) => {
                    if let Handled::Residual(rest) = child.handle_messages(group).await {
                        residual.extend(rest);
                    }
                }
                None => {
                    self.status
                        .set(format!("no store available for category {category}"));
                    residual.extend(group);
                }
            }
        }

        if residual.is_empty() {
            Handled::Complete
        } else {
            Handled::Residual(residual)
        }
    }

    async fn periodic_check(&mut self) {
        for (_, child) in self.children.iter_mut() {
            child.periodic_check().await;
        }
    }

    async fn flush(&mut self) {
        for (_, child) in self.children.iter_mut() {
            child.flush().await;
        }
    }

    fn copy_for_category(&self, category: &str) -> Box<dyn Store> {
        let mut copy = CategoryStore::with_model(category, self.store_type_name);
        copy.model = self
            .model
            .as_ref()
            .map(|model| model.copy_for_category(category));
        copy.config_error = self.config_error.clone();
        Box::new(copy)
    }

    fn status(&self) -> String {
        let own = self.status.get();
        if !own.is_empty() {
            return own;
        }
        self.children
            .values()
            .map(|c| c.status())
            .find(|s| !s.is_empty())
            .unwrap_or_default()
    }
}
