//! Topic registry.
//!
//! Handlers are type-erased once, at registration: each entry stores a thunk
//! that already knows how to decode its payload shape and call the handler.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use futures::future::{self, BoxFuture, FutureExt};
use serde::de::DeserializeOwned;
use switchboard_core::{HandlerError, RegistrationError};

use crate::connection::Request;

/// Future returned by an erased handler.
pub type HandlerFuture = BoxFuture<'static, Result<(), HandlerError>>;

type Invoke = Arc<dyn Fn(Request) -> HandlerFuture + Send + Sync>;

/// Registry entry for one topic.
#[derive(Clone)]
pub struct HandlerDescriptor {
    topic: String,
    payload_shape: Option<&'static str>,
    invoke: Invoke,
}

impl HandlerDescriptor {
    /// Topic this handler serves.
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Type name of the decoded payload, `None` for payload-less handlers.
    pub fn payload_shape(&self) -> Option<&'static str> {
        self.payload_shape
    }

    /// Decode (if needed) and run the handler.
    ///
    /// The handler's own error is returned unchanged.
    pub fn invoke(&self, request: Request) -> HandlerFuture {
        (self.invoke)(request)
    }
}

impl std::fmt::Debug for HandlerDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerDescriptor")
            .field("topic", &self.topic)
            .field("payload_shape", &self.payload_shape)
            .finish_non_exhaustive()
    }
}

/// Mapping from topic to handler.
///
/// Built during setup and moved into a [`crate::dispatcher::Dispatcher`],
/// after which it is shared read-only by every connection.
#[derive(Default)]
pub struct TopicRegistry {
    handlers: HashMap<String, HandlerDescriptor>,
}

impl TopicRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler that takes no payload.
    ///
    /// # Panics
    ///
    /// Panics if `topic` is empty or already registered.
    pub fn register<F, Fut>(&mut self, topic: &str, handler: F) -> &mut Self
    where
        F: Fn(Request) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
    {
        if let Err(e) = self.try_register(topic, handler) {
            panic!("{e}");
        }
        self
    }

    /// Register a handler whose payload is decoded into `T` before the call.
    ///
    /// # Panics
    ///
    /// Panics if `topic` is empty or already registered.
    pub fn register_with_payload<T, F, Fut>(&mut self, topic: &str, handler: F) -> &mut Self
    where
        T: DeserializeOwned + Send + 'static,
        F: Fn(Request, T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
    {
        if let Err(e) = self.try_register_with_payload(topic, handler) {
            panic!("{e}");
        }
        self
    }

    /// Fallible form of [`TopicRegistry::register`].
    pub fn try_register<F, Fut>(&mut self, topic: &str, handler: F) -> Result<(), RegistrationError>
    where
        F: Fn(Request) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
    {
        let invoke: Invoke = Arc::new(move |request| handler(request).boxed());
        self.insert(topic, None, invoke)
    }

    /// Fallible form of [`TopicRegistry::register_with_payload`].
    pub fn try_register_with_payload<T, F, Fut>(
        &mut self,
        topic: &str,
        handler: F,
    ) -> Result<(), RegistrationError>
    where
        T: DeserializeOwned + Send + 'static,
        F: Fn(Request, T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
    {
        let invoke: Invoke = Arc::new(move |request: Request| match request.payload::<T>() {
            Ok(payload) => handler(request, payload).boxed(),
            Err(e) => future::ready(Err(e)).boxed(),
        });
        self.insert(topic, Some(std::any::type_name::<T>()), invoke)
    }

    fn insert(
        &mut self,
        topic: &str,
        payload_shape: Option<&'static str>,
        invoke: Invoke,
    ) -> Result<(), RegistrationError> {
        if topic.is_empty() {
            return Err(RegistrationError::EmptyTopic);
        }
        if self.handlers.contains_key(topic) {
            return Err(RegistrationError::DuplicateTopic(topic.to_owned()));
        }
        let descriptor = HandlerDescriptor {
            topic: topic.to_owned(),
            payload_shape,
            invoke,
        };
        let _ = self.handlers.insert(topic.to_owned(), descriptor);
        Ok(())
    }

    /// Look up the handler for a topic.
    pub fn get(&self, topic: &str) -> Option<&HandlerDescriptor> {
        self.handlers.get(topic)
    }

    /// Whether a topic is registered.
    pub fn has_topic(&self, topic: &str) -> bool {
        self.handlers.contains_key(topic)
    }

    /// All registered topics (sorted).
    pub fn topics(&self) -> Vec<String> {
        let mut names: Vec<String> = self.handlers.keys().cloned().collect();
        names.sort();
        names
    }

    /// Number of registered topics.
    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    /// Whether nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}
