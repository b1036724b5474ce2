// Operation identity
// This file builds the composite key that groups every invocation of the same
// logical action, plus the per-call values that are deliberately kept out of it

use std::fmt;
use std::hash::{Hash, Hasher};

pub const CATEGORY_MVC: &str = "MVC";
pub const CATEGORY_API: &str = "API";

/// Static metadata a framework integration keeps for one routed action.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActionDescriptor {
    pub category: String,
    pub group: String,
    pub member: String,
    pub parameters: Vec<String>,
    track_action: bool,
    track_group: bool,
}

impl ActionDescriptor {
    pub fn new(
        category: impl Into<String>,
        group: impl Into<String>,
        member: impl Into<String>,
    ) -> Self {
        Self {
            category: category.into(),
            group: group.into(),
            member: member.into(),
            parameters: Vec::new(),
            track_action: true,
            track_group: true,
        }
    }

    pub fn mvc(group: impl Into<String>, member: impl Into<String>) -> Self {
        Self::new(CATEGORY_MVC, group, member)
    }

    pub fn api(group: impl Into<String>, member: impl Into<String>) -> Self {
        Self::new(CATEGORY_API, group, member)
    }

    pub fn with_parameters<I, S>(mut self, parameters: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.parameters = parameters.into_iter().map(Into::into).collect();
        self
    }

    /// Opt this single action out of instrumentation.
    pub fn untracked(mut self) -> Self {
        self.track_action = false;
        self
    }

    /// Opt out on behalf of the whole group (controller) this action belongs to.
    pub fn group_untracked(mut self) -> Self {
        self.track_group = false;
        self
    }

    /// Checked by the framework before calling `begin_operation`.
    pub fn is_tracked(&self) -> bool {
        self.track_action && self.track_group
    }
}

/// Identity of one monitored operation.
///
/// Equality and hashing use only the composed raw identity string, so two
/// values built from the same fields always land on the same cache entry.
#[derive(Debug, Clone)]
pub struct OperationIdentity {
    process_id: u32,
    category: String,
    group: String,
    member: String,
    method: String,
    parameters: Vec<String>,
    raw: String,
}

impl OperationIdentity {
    pub fn new(
        process_id: u32,
        category: impl Into<String>,
        group: impl Into<String>,
        member: impl Into<String>,
        method: impl Into<String>,
        parameters: Vec<String>,
    ) -> Self {
        let category = category.into();
        let group = group.into();
        let member = member.into();
        let method = method.into();
        let raw = raw_identity(process_id, &category, &group, &member, &method, &parameters);
        Self {
            process_id,
            category,
            group,
            member,
            method,
            parameters,
            raw,
        }
    }

    pub fn from_descriptor(process_id: u32, descriptor: &ActionDescriptor, method: &str) -> Self {
        Self::new(
            process_id,
            descriptor.category.as_str(),
            descriptor.group.as_str(),
            descriptor.member.as_str(),
            method,
            descriptor.parameters.clone(),
        )
    }

    pub fn process_id(&self) -> u32 {
        self.process_id
    }

    pub fn category(&self) -> &str {
        &self.category
    }

    pub fn group(&self) -> &str {
        &self.group
    }

    pub fn member(&self) -> &str {
        &self.member
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    pub fn parameters(&self) -> &[String] {
        &self.parameters
    }

    /// The composed key string.
    pub fn raw(&self) -> &str {
        &self.raw
    }
}

impl PartialEq for OperationIdentity {
    fn eq(&self, other: &Self) -> bool {
        self.raw == other.raw
    }
}

impl Eq for OperationIdentity {}

impl Hash for OperationIdentity {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.raw.hash(state);
    }
}

impl fmt::Display for OperationIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

/// Compose the raw identity: `[{pid}]-{category} {group}.{member}[{params}] {method}`.
pub fn raw_identity(
    process_id: u32,
    category: &str,
    group: &str,
    member: &str,
    method: &str,
    parameters: &[String],
) -> String {
    format!(
        "[{}]-{} {}.{}[{}] {}",
        process_id,
        category,
        group,
        member,
        parameters.join(","),
        method
    )
}

/// Values that vary per call and are not part of the identity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Invocation {
    /// Request body length in bytes, 0 when unknown.
    pub content_length: u64,
}

impl Invocation {
    pub fn new(content_length: u64) -> Self {
        Self { content_length }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn home_index(method: &str) -> OperationIdentity {
        OperationIdentity::new(42, "MVC", "Home", "Index", method, Vec::new())
    }

    #[test]
    fn identical_fields_produce_identical_raw_identity() {
        let a = home_index("GET");
        let b = home_index("GET");
        assert_eq!(a.raw(), b.raw());
        assert_eq!(a, b);
        assert_eq!(a.raw(), "[42]-MVC Home.Index[] GET");
    }

    #[test]
    fn any_differing_field_changes_raw_identity() {
        let base = OperationIdentity::new(
            7,
            "API",
            "Albums",
            "Get",
            "GET",
            vec!["id".to_string()],
        );
        let variants = [
            OperationIdentity::new(8, "API", "Albums", "Get", "GET", vec!["id".into()]),
            OperationIdentity::new(7, "MVC", "Albums", "Get", "GET", vec!["id".into()]),
            OperationIdentity::new(7, "API", "Artists", "Get", "GET", vec!["id".into()]),
            OperationIdentity::new(7, "API", "Albums", "List", "GET", vec!["id".into()]),
            OperationIdentity::new(7, "API", "Albums", "Get", "POST", vec!["id".into()]),
            OperationIdentity::new(7, "API", "Albums", "Get", "GET", vec!["slug".into()]),
            OperationIdentity::new(7, "API", "Albums", "Get", "GET", Vec::new()),
        ];
        for variant in &variants {
            assert_ne!(base.raw(), variant.raw(), "{variant} should differ from {base}");
            assert_ne!(&base, variant);
        }
    }

    #[test]
    fn parameter_order_is_significant() {
        let ab = OperationIdentity::new(1, "MVC", "Store", "Browse", "GET", vec!["a".into(), "b".into()]);
        let ba = OperationIdentity::new(1, "MVC", "Store", "Browse", "GET", vec!["b".into(), "a".into()]);
        assert_eq!(ab.raw(), "[1]-MVC Store.Browse[a,b] GET");
        assert_ne!(ab, ba);
    }

    #[test]
    fn descriptor_opt_out_markers() {
        let tracked = ActionDescriptor::mvc("Home", "Index");
        assert!(tracked.is_tracked());
        assert!(!tracked.clone().untracked().is_tracked());
        assert!(!tracked.group_untracked().is_tracked());
    }

    #[test]
    fn identity_from_descriptor_matches_direct_construction() {
        let descriptor = ActionDescriptor::api("Cart", "Add").with_parameters(["id", "qty"]);
        let identity = OperationIdentity::from_descriptor(3, &descriptor, "POST");
        assert_eq!(identity.raw(), "[3]-API Cart.Add[id,qty] POST");
        assert_eq!(identity.parameters(), &["id".to_string(), "qty".to_string()]);
    }
}
