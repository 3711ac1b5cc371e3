// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Message Type Bindings
//!
//! Application message types declare their wire type URN (and optionally an
//! expiry) by implementing [`Message`]. The [`MessageBindingResolver`] is
//! assembled from an explicit list of those declarations at startup and
//! answers URN and runtime type lookups in constant time.

use crate::errors::AmqpError;
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use std::{
    any::{type_name, Any, TypeId},
    collections::HashMap,
    fmt,
    hash::{Hash, Hasher},
    sync::Arc,
    time::Duration,
};
use tracing::debug;

/// Type-erased message content as produced by a binding's decoder.
pub type AnyContent = Arc<dyn Any + Send + Sync>;

type DecodeFn = fn(Value) -> Result<AnyContent, AmqpError>;

/// Declares an application type as a message carried over the broker.
///
/// ```ignore
/// #[derive(Serialize, Deserialize)]
/// struct OrderPlaced { id: u64 }
///
/// impl Message for OrderPlaced {
///     const MESSAGE_TYPE: &'static str = "urn:message:order-placed";
///     const EXPIRES_AFTER: Option<Duration> = Some(Duration::from_secs(30));
/// }
/// ```
pub trait Message: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// The wire type URN carried in the `type` property.
    const MESSAGE_TYPE: &'static str;

    /// Expiry applied to every published instance.
    const EXPIRES_AFTER: Option<Duration> = None;
}

/// Runtime type bound to a URN, together with its typed decoder.
#[derive(Clone, Copy)]
pub struct TypeDescriptor {
    name: &'static str,
    type_id: TypeId,
    decode: DecodeFn,
}

impl TypeDescriptor {
    pub fn of<T: Message>() -> Self {
        TypeDescriptor {
            name: type_name::<T>(),
            type_id: TypeId::of::<T>(),
            decode: decode_as::<T>,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn type_id(&self) -> TypeId {
        self.type_id
    }

    pub fn is<T: 'static>(&self) -> bool {
        self.type_id == TypeId::of::<T>()
    }

    /// Decodes a deserialized body into the bound runtime type.
    pub fn decode(&self, value: Value) -> Result<AnyContent, AmqpError> {
        (self.decode)(value)
    }
}

impl fmt::Debug for TypeDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("TypeDescriptor").field(&self.name).finish()
    }
}

fn decode_as<T: Message>(value: Value) -> Result<AnyContent, AmqpError> {
    serde_json::from_value::<T>(value)
        .map(|content| Arc::new(content) as AnyContent)
        .map_err(|err| AmqpError::ParsePayloadError(err.to_string()))
}

/// Association between a wire type URN and a runtime type.
///
/// Identity is the URN alone: two bindings with the same raw name are equal
/// even when they point at different runtime types. The resolver relies on
/// this to reject duplicate registrations.
#[derive(Debug, Clone)]
pub struct MessageBinding {
    raw_name: String,
    runtime_type: TypeDescriptor,
    expires_after: Option<Duration>,
}

impl MessageBinding {
    pub fn new(
        raw_name: &str,
        runtime_type: TypeDescriptor,
        expires_after: Option<Duration>,
    ) -> Self {
        MessageBinding {
            raw_name: raw_name.to_owned(),
            runtime_type,
            expires_after,
        }
    }

    /// Builds the binding a [`Message`] declares.
    pub fn of<T: Message>() -> Self {
        MessageBinding::new(T::MESSAGE_TYPE, TypeDescriptor::of::<T>(), T::EXPIRES_AFTER)
    }

    pub fn raw_name(&self) -> &str {
        &self.raw_name
    }

    pub fn runtime_type(&self) -> &TypeDescriptor {
        &self.runtime_type
    }

    pub fn expires_after(&self) -> Option<Duration> {
        self.expires_after
    }
}

impl PartialEq for MessageBinding {
    fn eq(&self, other: &Self) -> bool {
        self.raw_name == other.raw_name
    }
}

impl Eq for MessageBinding {}

impl Hash for MessageBinding {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.raw_name.hash(state);
    }
}

/// Resolves bindings by wire URN and by runtime type.
///
/// An unknown URN or type is `Ok(None)`; errors are reserved for inputs that
/// can never resolve, such as an empty URN.
pub trait MessageTypeResolver: Send + Sync {
    fn resolve(&self, raw_name: &str) -> Result<Option<Arc<MessageBinding>>, AmqpError>;

    fn resolve_type(&self, type_id: TypeId) -> Result<Option<Arc<MessageBinding>>, AmqpError>;
}

impl dyn MessageTypeResolver {
    /// Typed shortcut over [`MessageTypeResolver::resolve_type`].
    pub fn resolve_message<T: 'static>(&self) -> Result<Arc<MessageBinding>, AmqpError> {
        self.resolve_type(TypeId::of::<T>())?
            .ok_or_else(|| AmqpError::UnboundMessageType(type_name::<T>().to_owned()))
    }
}

/// Statically assembled registration table.
#[derive(Debug, Default)]
pub struct MessageBindingResolver {
    by_name: HashMap<String, Arc<MessageBinding>>,
    by_type: HashMap<TypeId, Arc<MessageBinding>>,
}

impl MessageBindingResolver {
    pub fn builder() -> MessageBindingResolverBuilder {
        MessageBindingResolverBuilder::default()
    }
}

impl MessageTypeResolver for MessageBindingResolver {
    fn resolve(&self, raw_name: &str) -> Result<Option<Arc<MessageBinding>>, AmqpError> {
        if raw_name.is_empty() {
            return Err(AmqpError::MissingMessageType);
        }

        Ok(self.by_name.get(raw_name).cloned())
    }

    fn resolve_type(&self, type_id: TypeId) -> Result<Option<Arc<MessageBinding>>, AmqpError> {
        Ok(self.by_type.get(&type_id).cloned())
    }
}

/// Collects message declarations for a [`MessageBindingResolver`].
#[derive(Debug, Default)]
pub struct MessageBindingResolverBuilder {
    bindings: Vec<MessageBinding>,
}

impl MessageBindingResolverBuilder {
    /// Registers a declared message type.
    pub fn register<T: Message>(self) -> Self {
        self.bind(MessageBinding::of::<T>())
    }

    /// Registers an explicit binding.
    pub fn bind(mut self, binding: MessageBinding) -> Self {
        self.bindings.push(binding);
        self
    }

    /// Builds the lookup tables.
    ///
    /// # Returns
    /// * `Result<MessageBindingResolver, AmqpError>` - An error when a URN is empty
    ///   or registered more than once
    pub fn build(self) -> Result<MessageBindingResolver, AmqpError> {
        let mut resolver = MessageBindingResolver::default();

        for binding in self.bindings {
            if binding.raw_name.is_empty() {
                return Err(AmqpError::InvalidConfiguration(format!(
                    "empty message type for `{}`",
                    binding.runtime_type.name
                )));
            }

            if resolver.by_name.contains_key(&binding.raw_name) {
                return Err(AmqpError::DuplicateMessageType(binding.raw_name));
            }

            debug!(
                message_type = binding.raw_name.as_str(),
                runtime_type = binding.runtime_type.name,
                "message type bound"
            );

            let binding = Arc::new(binding);
            resolver
                .by_type
                .insert(binding.runtime_type.type_id, binding.clone());
            resolver.by_name.insert(binding.raw_name.clone(), binding);
        }

        Ok(resolver)
    }
}
