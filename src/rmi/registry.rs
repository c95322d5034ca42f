//! Live remote objects and the class factories that create them.
//!
//! The [`ObjectRegistry`] is the [`CallHandler`] installed on served Pipes:
//! it decodes each call frame, finds the target object by Guid and frames
//! the outcome as a result. Calls addressed to [`MANAGER_ID`] are served by
//! the registry itself:
//!
//! | Method           | Inputs         | Outputs          |
//! |------------------|----------------|------------------|
//! | `create_object`  | class `String` | `Guid`           |
//! | `discard_object` | `Guid`         | `bool`           |
//! | `query_object`   | `Guid`         | `Option<String>` |
//!
//! Objects are not tied to the Pipe or host that created them. They live
//! until `discard_object` or until the registry is dropped, so a proxy keeps
//! working across a reconnect; a peer that never discards its objects keeps
//! them alive for the life of the serving process.

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::RwLock;

use super::call::{decode_call, encode_result, result_from};
use super::stub::RemoteObject;
use crate::buffer::Buffer;
use crate::error::{RmiError, Result};
use crate::guid::Guid;
use crate::protocol::Status;
use crate::transport::{BoxFuture, CallHandler};

/// Well-known id of the object manager every registry serves.
pub const MANAGER_ID: Guid = Guid::from_parts(0, 1);

/// Builds a fresh object of one class.
pub type ClassFactory = Box<dyn Fn() -> Arc<dyn RemoteObject> + Send + Sync>;

/// Registry of classes and live objects.
#[derive(Default)]
pub struct ObjectRegistry {
    classes: RwLock<HashMap<String, ClassFactory>>,
    objects: RwLock<HashMap<Guid, Arc<dyn RemoteObject>>>,
}

impl ObjectRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Make `class` creatable through `create_object`.
    pub fn register_class<F>(&self, class: &str, factory: F)
    where
        F: Fn() -> Arc<dyn RemoteObject> + Send + Sync + 'static,
    {
        self.classes
            .write()
            .insert(class.to_string(), Box::new(factory));
    }

    /// Publish an existing object under a fresh id.
    pub fn register_object(&self, object: Arc<dyn RemoteObject>) -> Guid {
        let id = Guid::generate();
        self.register_object_with_id(id, object);
        id
    }

    /// Publish an object under a caller-chosen id, replacing any previous one.
    pub fn register_object_with_id(&self, id: Guid, object: Arc<dyn RemoteObject>) {
        tracing::debug!(object = %id, class = object.class_name(), "object registered");
        self.objects.write().insert(id, object);
    }

    /// Instantiate `class` and return the new object's id. The object stays
    /// registered until discarded.
    pub fn create_object(&self, class: &str) -> Result<Guid> {
        let object = {
            let classes = self.classes.read();
            let factory = classes
                .get(class)
                .ok_or(RmiError::Remote(Status::UnknownClass))?;
            factory()
        };
        Ok(self.register_object(object))
    }

    /// Drop an object. Returns whether it existed.
    pub fn discard_object(&self, id: Guid) -> bool {
        let removed = self.objects.write().remove(&id).is_some();
        if removed {
            tracing::debug!(object = %id, "object discarded");
        }
        removed
    }

    /// Class name of a live object.
    pub fn query_object(&self, id: Guid) -> Option<String> {
        self.objects
            .read()
            .get(&id)
            .map(|o| o.class_name().to_string())
    }

    pub fn object(&self, id: Guid) -> Option<Arc<dyn RemoteObject>> {
        self.objects.read().get(&id).cloned()
    }

    pub fn object_count(&self) -> usize {
        self.objects.read().len()
    }

    fn serve_manager(&self, method: &str, mut inputs: Buffer) -> Result<Buffer> {
        let mut out = Buffer::new();
        match method {
            "create_object" => {
                let class: String = inputs.read()?;
                out.write(&self.create_object(&class)?)?;
            }
            "discard_object" => {
                let id: Guid = inputs.read()?;
                out.write(&self.discard_object(id))?;
            }
            "query_object" => {
                let id: Guid = inputs.read()?;
                out.write(&self.query_object(id))?;
            }
            _ => return Err(RmiError::Remote(Status::UnknownMethod)),
        }
        Ok(out)
    }
}

impl CallHandler for ObjectRegistry {
    fn handle_call(&self, payload: Bytes) -> BoxFuture<'static, Bytes> {
        let request = match decode_call(&payload) {
            Ok(request) => request,
            Err(e) => {
                tracing::warn!(error = %e, "malformed call frame");
                let reply = encode_result(e.status(), None);
                return Box::pin(async move { reply });
            }
        };

        if request.object == MANAGER_ID {
            let reply = result_from(self.serve_manager(&request.method, request.inputs));
            return Box::pin(async move { reply });
        }

        match self.object(request.object) {
            Some(object) => {
                let pending = object.invoke(&request.method, request.inputs);
                Box::pin(async move { result_from(pending.await) })
            }
            None => {
                tracing::debug!(object = %request.object, "call to unknown object");
                let reply = encode_result(Status::UnknownObject, None);
                Box::pin(async move { reply })
            }
        }
    }
}

impl std::fmt::Debug for ObjectRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObjectRegistry")
            .field("classes", &self.classes.read().len())
            .field("objects", &self.objects.read().len())
            .finish()
    }
}
