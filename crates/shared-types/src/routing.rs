//! # Routing
//!
//! Binding keys, subscriptions and the matching rules that decide which peer
//! receives which message.
//!
//! ## Matching Rules
//!
//! - Parts are compared position by position up to the shorter key.
//! - A pattern part that is empty or absent is a wildcard.
//! - Any other pattern part must equal the candidate part (ordinal comparison).
//! - Missing trailing parts on either side never cause a mismatch.
//!
//! The last rule is deliberately permissive and is kept for compatibility with
//! existing subscribers. Tightening it needs a compatibility review first.

use crate::entities::MessageTypeId;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

// =============================================================================
// BINDING KEYS
// =============================================================================

/// Ordered routing parts extracted from a message, or a subscription pattern.
///
/// An empty key is the "any" pattern when used as a subscription, and the
/// "no routable members" candidate when built from a message.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct BindingKey {
    parts: Vec<Option<String>>,
}

impl BindingKey {
    /// The empty key: matches everything, is matched by everything.
    #[must_use]
    pub fn any() -> Self {
        Self::default()
    }

    /// Build a key from explicit, possibly absent, parts.
    #[must_use]
    pub fn new(parts: Vec<Option<String>>) -> Self {
        Self { parts }
    }

    /// Build a key where every part is present.
    pub fn from_parts<I, S>(parts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            parts: parts.into_iter().map(|p| Some(p.into())).collect(),
        }
    }

    /// Number of parts.
    #[must_use]
    pub fn part_count(&self) -> usize {
        self.parts.len()
    }

    /// `true` for the "any" key.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.parts.is_empty()
    }

    /// Part at `index`, `None` when absent or out of range.
    #[must_use]
    pub fn part(&self, index: usize) -> Option<&str> {
        self.parts.get(index).and_then(|p| p.as_deref())
    }

    /// `true` if the part at `index` matches any value.
    #[must_use]
    pub fn is_wildcard(&self, index: usize) -> bool {
        self.part(index).map_or(true, str::is_empty)
    }

    /// Treat `self` as a pattern and test it against a candidate key.
    #[must_use]
    pub fn matches(&self, candidate: &BindingKey) -> bool {
        let common = self.part_count().min(candidate.part_count());
        (0..common).all(|index| {
            self.is_wildcard(index) || self.part(index) == Some(candidate.part(index).unwrap_or(""))
        })
    }
}

impl fmt::Display for BindingKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.parts.is_empty() {
            return f.write_str("#");
        }
        let rendered: Vec<&str> = self
            .parts
            .iter()
            .map(|p| match p.as_deref() {
                None | Some("") => "*",
                Some(value) => value,
            })
            .collect();
        f.write_str(&rendered.join("."))
    }
}

// =============================================================================
// ROUTING VALUES
// =============================================================================

/// Conversion of a routable field into its canonical binding-key part.
pub trait RoutingPart {
    /// Canonical text form used for matching.
    fn to_routing_part(&self) -> String;
}

impl RoutingPart for bool {
    fn to_routing_part(&self) -> String {
        if *self { "True" } else { "False" }.to_string()
    }
}

impl RoutingPart for str {
    fn to_routing_part(&self) -> String {
        self.to_string()
    }
}

impl RoutingPart for String {
    fn to_routing_part(&self) -> String {
        self.clone()
    }
}

impl RoutingPart for Uuid {
    fn to_routing_part(&self) -> String {
        self.hyphenated().to_string()
    }
}

impl RoutingPart for f64 {
    fn to_routing_part(&self) -> String {
        // Rust float formatting is locale-independent and round-trips.
        self.to_string()
    }
}

macro_rules! integer_routing_part {
    ($($t:ty),*) => {
        $(
            impl RoutingPart for $t {
                fn to_routing_part(&self) -> String {
                    self.to_string()
                }
            }
        )*
    };
}

integer_routing_part!(u8, u16, u32, u64, i8, i16, i32, i64, usize);

impl<T: RoutingPart> RoutingPart for Option<T> {
    fn to_routing_part(&self) -> String {
        self.as_ref().map(RoutingPart::to_routing_part).unwrap_or_default()
    }
}

// =============================================================================
// MESSAGES
// =============================================================================

/// A message that can travel on the bus.
pub trait BusMessage: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Fully-qualified type name, used as the `MessageTypeId`.
    const TYPE_NAME: &'static str;

    /// The stable type identifier of this message.
    fn message_type_id() -> MessageTypeId {
        MessageTypeId::new(Self::TYPE_NAME)
    }

    /// Actual routing values of this instance, in declared routing order.
    ///
    /// Non-routable messages keep the default empty key.
    fn binding_key(&self) -> BindingKey {
        BindingKey::any()
    }

    /// Whether copies of this message are stored for down persistent peers.
    fn is_persistent() -> bool {
        true
    }
}

/// A message's type together with its actual routing values.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MessageBinding {
    /// The message type.
    pub message_type_id: MessageTypeId,
    /// Routing values of the instance.
    pub routing_key: BindingKey,
}

impl MessageBinding {
    /// Binding for an explicit type and routing key.
    #[must_use]
    pub fn new(message_type_id: MessageTypeId, routing_key: BindingKey) -> Self {
        Self {
            message_type_id,
            routing_key,
        }
    }

    /// Binding of a concrete message instance.
    pub fn of<M: BusMessage>(message: &M) -> Self {
        Self::new(M::message_type_id(), message.binding_key())
    }
}

// =============================================================================
// SUBSCRIPTIONS
// =============================================================================

/// Interest of a peer in a message type, optionally narrowed by a binding key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Subscription {
    /// Subscribed message type.
    pub message_type_id: MessageTypeId,
    /// Pattern over the routing values; empty means every instance.
    pub binding_key: BindingKey,
}

impl Subscription {
    /// Subscription with an explicit pattern.
    #[must_use]
    pub fn new(message_type_id: MessageTypeId, binding_key: BindingKey) -> Self {
        Self {
            message_type_id,
            binding_key,
        }
    }

    /// Subscription to every instance of `M`.
    #[must_use]
    pub fn any<M: BusMessage>() -> Self {
        Self::new(M::message_type_id(), BindingKey::any())
    }

    /// Subscription to instances of `M` matching `binding_key`.
    #[must_use]
    pub fn matching<M: BusMessage>(binding_key: BindingKey) -> Self {
        Self::new(M::message_type_id(), binding_key)
    }

    /// `true` if this subscription selects the given message binding.
    #[must_use]
    pub fn matches(&self, binding: &MessageBinding) -> bool {
        self.message_type_id == binding.message_type_id
            && self.binding_key.matches(&binding.routing_key)
    }
}

impl fmt::Display for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.message_type_id, self.binding_key)
    }
}

/// The complete set of a peer's patterns for one message type.
///
/// An empty `binding_keys` list is the removal sentinel: "unsubscribe from
/// this type".
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionsForType {
    /// The message type.
    pub message_type_id: MessageTypeId,
    /// Every pattern the peer holds for that type.
    pub binding_keys: Vec<BindingKey>,
}

impl SubscriptionsForType {
    /// Patterns for one type.
    #[must_use]
    pub fn new(message_type_id: MessageTypeId, binding_keys: Vec<BindingKey>) -> Self {
        Self {
            message_type_id,
            binding_keys,
        }
    }

    /// Removal sentinel for `message_type_id`.
    #[must_use]
    pub fn removal(message_type_id: MessageTypeId) -> Self {
        Self::new(message_type_id, Vec::new())
    }

    /// `true` when this entry unsubscribes from its type.
    #[must_use]
    pub fn is_removal(&self) -> bool {
        self.binding_keys.is_empty()
    }

    /// Expand into one subscription per binding key.
    #[must_use]
    pub fn to_subscriptions(&self) -> Vec<Subscription> {
        self.binding_keys
            .iter()
            .map(|key| Subscription::new(self.message_type_id.clone(), key.clone()))
            .collect()
    }
}
