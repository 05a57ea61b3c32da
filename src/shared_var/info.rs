//! Shared variable descriptors
//!
//! Identity, shape, write permissions and subscriptions of a distributed
//! variable. The variable's content lives elsewhere.

use std::collections::BTreeSet;
use std::fmt;
use std::time::SystemTime;

use serde::{Deserialize, Serialize};

use super::{SharedVarError, SharedVarResult};

/// Who may write a shared variable
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum WriterPolicy {
    /// Any module may write
    #[default]
    Unrestricted,
    /// Only the listed modules may write; never empty
    RestrictedTo(BTreeSet<String>),
}

impl WriterPolicy {
    /// Restrict writes to the given modules
    ///
    /// An empty list would make the variable unwritable and is rejected.
    pub fn restricted_to<I, S>(writers: I) -> SharedVarResult<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let writers: BTreeSet<String> = writers.into_iter().map(Into::into).collect();
        if writers.is_empty() {
            return Err(SharedVarError::EmptyWriterList);
        }
        Ok(WriterPolicy::RestrictedTo(writers))
    }

    /// `None` means unrestricted
    pub fn from_optional_list(writers: Option<Vec<String>>) -> SharedVarResult<Self> {
        match writers {
            None => Ok(WriterPolicy::Unrestricted),
            Some(list) => Self::restricted_to(list),
        }
    }

    pub fn allows(&self, module: &str) -> bool {
        match self {
            WriterPolicy::Unrestricted => true,
            WriterPolicy::RestrictedTo(writers) => writers.contains(module),
        }
    }

    /// The writer set, or None when unrestricted
    pub fn writers(&self) -> Option<&BTreeSet<String>> {
        match self {
            WriterPolicy::Unrestricted => None,
            WriterPolicy::RestrictedTo(writers) => Some(writers),
        }
    }
}

/// Which writes a subscriber wants to hear about
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SubscriptionKind {
    /// Every write
    WriteAny,
    /// Writes made by any module other than the subscriber
    WriteOthers,
    /// Writes made by one specific module
    WriteModule(String),
}

impl fmt::Display for SubscriptionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SubscriptionKind::WriteAny => f.write_str("write_any"),
            SubscriptionKind::WriteOthers => f.write_str("write_others"),
            SubscriptionKind::WriteModule(m) => write!(f, "write_module:{}", m),
        }
    }
}

/// What a notification carries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ReportKind {
    /// Variable name and writer only
    #[default]
    Notify,
    /// Also the written content
    SendContent,
}

/// One module's interest in a shared variable
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SharedVariableSubscriptionInfo {
    subscriber: String,
    kind: SubscriptionKind,
    report: ReportKind,
    value_filter: Option<String>,
}

impl SharedVariableSubscriptionInfo {
    pub fn new(subscriber: impl Into<String>, kind: SubscriptionKind, report: ReportKind) -> Self {
        Self {
            subscriber: subscriber.into(),
            kind,
            report,
            value_filter: None,
        }
    }

    /// Only notify when the written value equals `value`
    pub fn with_value_filter(mut self, value: impl Into<String>) -> Self {
        self.value_filter = Some(value.into());
        self
    }

    pub fn subscriber(&self) -> &str {
        &self.subscriber
    }

    pub fn kind(&self) -> &SubscriptionKind {
        &self.kind
    }

    pub fn report(&self) -> ReportKind {
        self.report
    }

    pub fn value_filter(&self) -> Option<&str> {
        self.value_filter.as_deref()
    }

    /// Two registrations with the same identity replace each other
    pub fn same_identity(&self, other: &Self) -> bool {
        self.subscriber == other.subscriber
            && self.kind == other.kind
            && self.value_filter == other.value_filter
    }

    /// Whether this subscription wants to hear about `write`
    pub fn matches(&self, write: &VariableWrite) -> bool {
        let kind_matches = match &self.kind {
            SubscriptionKind::WriteAny => true,
            SubscriptionKind::WriteOthers => write.writer != self.subscriber,
            SubscriptionKind::WriteModule(module) => write.writer == *module,
        };

        kind_matches
            && self
                .value_filter
                .as_deref()
                .map_or(true, |expected| expected == write.value)
    }
}

/// A successful write, as reported by the variable store
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VariableWrite {
    pub writer: String,
    pub value: String,
    pub time: SystemTime,
}

impl VariableWrite {
    pub fn new(writer: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            writer: writer.into(),
            value: value.into(),
            time: SystemTime::now(),
        }
    }
}

/// Descriptor of a distributed variable
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SharedVariableInfo {
    name: String,
    type_name: String,
    is_array: bool,
    length: Option<usize>,
    creation_time: SystemTime,
    allowed_writers: WriterPolicy,
    subscriptions: Vec<SharedVariableSubscriptionInfo>,
}

impl SharedVariableInfo {
    /// Describe a scalar variable
    pub fn scalar(name: impl Into<String>, type_name: impl Into<String>) -> Self {
        Self::build(name.into(), type_name.into(), false, None)
    }

    /// Describe an array variable; `None` length means unbounded
    pub fn array(
        name: impl Into<String>,
        type_name: impl Into<String>,
        length: Option<usize>,
    ) -> Self {
        Self::build(name.into(), type_name.into(), true, length)
    }

    fn build(name: String, type_name: String, is_array: bool, length: Option<usize>) -> Self {
        Self {
            name,
            type_name,
            is_array,
            length: if is_array { length } else { None },
            creation_time: SystemTime::now(),
            allowed_writers: WriterPolicy::Unrestricted,
            subscriptions: Vec::new(),
        }
    }

    pub fn with_writers(mut self, writers: WriterPolicy) -> Self {
        self.allowed_writers = writers;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    pub fn is_array(&self) -> bool {
        self.is_array
    }

    /// Element count; only ever Some for bounded arrays
    pub fn length(&self) -> Option<usize> {
        self.length
    }

    pub fn creation_time(&self) -> SystemTime {
        self.creation_time
    }

    pub fn allowed_writers(&self) -> &WriterPolicy {
        &self.allowed_writers
    }

    pub fn subscriptions(&self) -> &[SharedVariableSubscriptionInfo] {
        &self.subscriptions
    }

    /// Check that `other` describes the same fixed shape as `self`
    pub(crate) fn check_fixed_fields(&self, other: &SharedVariableInfo) -> SharedVarResult<()> {
        let mismatch = if self.type_name != other.type_name {
            Some("type_name")
        } else if self.is_array != other.is_array {
            Some("is_array")
        } else if self.length != other.length {
            Some("length")
        } else {
            None
        };

        match mismatch {
            Some(field) => Err(SharedVarError::ImmutableField {
                variable: self.name.clone(),
                field,
            }),
            None => Ok(()),
        }
    }

    /// Add or replace a subscription; returns true if it replaced one
    pub(crate) fn upsert_subscription(&mut self, info: SharedVariableSubscriptionInfo) -> bool {
        match self.subscriptions.iter_mut().find(|s| s.same_identity(&info)) {
            Some(existing) => {
                *existing = info;
                true
            }
            None => {
                self.subscriptions.push(info);
                false
            }
        }
    }

    /// Remove every subscription of `subscriber`; returns how many were removed
    pub(crate) fn remove_subscriber(&mut self, subscriber: &str) -> usize {
        let before = self.subscriptions.len();
        self.subscriptions.retain(|s| s.subscriber != subscriber);
        before - self.subscriptions.len()
    }
}
