use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::queue::{Priority, QueueItem};
use crate::runner::error::WorkerError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ElementKind {
    Vertex,
    Edge,
}

/// Identity of a graph element. The element itself lives elsewhere.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ElementRef {
    pub kind: ElementKind,
    pub id: String,
}

impl ElementRef {
    pub fn vertex(id: impl Into<String>) -> Self {
        Self {
            kind: ElementKind::Vertex,
            id: id.into(),
        }
    }

    pub fn edge(id: impl Into<String>) -> Self {
        Self {
            kind: ElementKind::Edge,
            id: id.into(),
        }
    }
}

/// What happened to the element or property.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ElementStatus {
    #[default]
    Update,
    Deletion,
    Hidden,
    Unhidden,
}

/// A graph-property change event, the JSON payload carried by queue items.
///
/// A message without `property_name` addresses the whole element.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PropertyMessage {
    pub elements: Vec<ElementRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub property_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub property_name: Option<String>,
    #[serde(default)]
    pub status: ElementStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workspace_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub visibility_source: Option<String>,
    #[serde(default)]
    pub priority: Priority,
    /// When non-empty, only these units may handle the message.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub unit_whitelist: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub unit_blacklist: Vec<String>,
    /// Property values known to the producer, by property name.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub properties: BTreeMap<String, Value>,
}

impl PropertyMessage {
    pub fn for_element(element: ElementRef) -> Self {
        Self::for_elements(vec![element])
    }

    pub fn for_elements(elements: Vec<ElementRef>) -> Self {
        Self {
            elements,
            property_key: None,
            property_name: None,
            status: ElementStatus::Update,
            workspace_id: None,
            visibility_source: None,
            priority: Priority::Normal,
            unit_whitelist: Vec::new(),
            unit_blacklist: Vec::new(),
            properties: BTreeMap::new(),
        }
    }

    pub fn property(mut self, key: impl Into<String>, name: impl Into<String>) -> Self {
        self.property_key = Some(key.into());
        self.property_name = Some(name.into());
        self
    }

    pub fn value(mut self, name: impl Into<String>, value: Value) -> Self {
        self.properties.insert(name.into(), value);
        self
    }

    pub fn status(mut self, status: ElementStatus) -> Self {
        self.status = status;
        self
    }

    pub fn priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn workspace(mut self, workspace_id: impl Into<String>) -> Self {
        self.workspace_id = Some(workspace_id.into());
        self
    }

    pub fn visibility(mut self, visibility_source: impl Into<String>) -> Self {
        self.visibility_source = Some(visibility_source.into());
        self
    }

    pub fn whitelist<I, S>(mut self, units: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.unit_whitelist = units.into_iter().map(Into::into).collect();
        self
    }

    pub fn blacklist<I, S>(mut self, units: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.unit_blacklist = units.into_iter().map(Into::into).collect();
        self
    }

    pub fn from_slice(payload: &[u8]) -> Result<Self, WorkerError> {
        Ok(serde_json::from_slice(payload)?)
    }

    /// Encode as a queue item using the message's own priority.
    pub fn to_item(&self, queue_name: impl Into<String>) -> Result<QueueItem, WorkerError> {
        QueueItem::json(queue_name, self, self.priority)
    }

    /// Whether a unit with this name may see the message at all.
    pub fn allows_unit(&self, unit: &str) -> bool {
        if !self.unit_whitelist.is_empty() && !self.unit_whitelist.iter().any(|u| u == unit) {
            return false;
        }
        !self.unit_blacklist.iter().any(|u| u == unit)
    }

    /// One context per addressed element.
    pub fn contexts(&self) -> Vec<WorkContext> {
        let properties = Arc::new(self.properties.clone());
        self.elements
            .iter()
            .map(|element| WorkContext {
                element: element.clone(),
                property_key: self.property_key.clone(),
                property_name: self.property_name.clone(),
                status: self.status,
                workspace_id: self.workspace_id.clone(),
                visibility_source: self.visibility_source.clone(),
                priority: self.priority,
                properties: properties.clone(),
            })
            .collect()
    }
}

/// One element of a message plus the message metadata. This is what units match on.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkContext {
    pub element: ElementRef,
    pub property_key: Option<String>,
    pub property_name: Option<String>,
    pub status: ElementStatus,
    pub workspace_id: Option<String>,
    pub visibility_source: Option<String>,
    pub priority: Priority,
    pub properties: Arc<BTreeMap<String, Value>>,
}

impl WorkContext {
    /// True when the message is about the element as a whole.
    pub fn is_element_level(&self) -> bool {
        self.property_name.is_none()
    }

    pub fn property_name_is(&self, name: &str) -> bool {
        self.property_name.as_deref() == Some(name)
    }

    /// Value of the addressed property, if the producer included it.
    pub fn property_value(&self) -> Option<&Value> {
        self.property_name
            .as_deref()
            .and_then(|name| self.properties.get(name))
    }

    pub fn property(&self, name: &str) -> Option<&Value> {
        self.properties.get(name)
    }

    /// Start a follow-up message about the same element.
    pub fn derive(&self) -> PropertyMessage {
        let mut message = PropertyMessage::for_element(self.element.clone());
        message.workspace_id = self.workspace_id.clone();
        message.visibility_source = self.visibility_source.clone();
        message.priority = self.priority;
        message
    }
}
