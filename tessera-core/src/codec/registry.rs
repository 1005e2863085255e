//! Process-wide codec registry.
//!
//! Codecs are built lazily on first use and cached for the life of the
//! process, keyed by type. A type is in one of three states: absent
//! (not started), on the current thread's build stack (in progress), or
//! registered (complete, or failed with its validation error). Observing an
//! in-progress type while building means the type nests itself.

use std::any::{Any, TypeId};
use std::cell::RefCell;
use std::collections::HashMap;
use std::sync::Arc;

use once_cell::sync::Lazy;
use parking_lot::RwLock;
use tracing::debug;

use crate::error::CodecError;

use super::{Codec, Structure};

#[derive(Clone)]
enum Registered {
    Complete(Arc<dyn Any + Send + Sync>),
    Failed(CodecError),
}

static REGISTRY: Lazy<RwLock<HashMap<TypeId, Registered>>> =
    Lazy::new(|| RwLock::new(HashMap::new()));

thread_local! {
    static BUILDING: RefCell<Vec<TypeId>> = const { RefCell::new(Vec::new()) };
}

/// Pops the build stack even if building panics.
struct BuildGuard;

impl Drop for BuildGuard {
    fn drop(&mut self) {
        BUILDING.with(|stack| {
            stack.borrow_mut().pop();
        });
    }
}

fn lookup<S: Structure>(id: TypeId) -> Option<Result<Arc<Codec<S>>, CodecError>> {
    let registered = REGISTRY.read().get(&id).cloned()?;
    Some(match registered {
        Registered::Complete(any) => any.downcast::<Codec<S>>().map_err(|_| CodecError::Registry {
            record: std::any::type_name::<S>().to_string(),
            reason: "registered codec has a different type".to_string(),
        }),
        Registered::Failed(err) => Err(err),
    })
}

/// The codec for `S`, building and validating it on first use.
///
/// Registration is idempotent: concurrent first uses may both build, and
/// the first result stored wins.
pub fn codec<S: Structure>() -> Result<Arc<Codec<S>>, CodecError> {
    let id = TypeId::of::<S>();
    if let Some(found) = lookup::<S>(id) {
        return found;
    }

    let in_progress = BUILDING.with(|stack| stack.borrow().contains(&id));
    if in_progress {
        return Err(CodecError::RecursiveStructure {
            record: std::any::type_name::<S>().to_string(),
        });
    }

    BUILDING.with(|stack| stack.borrow_mut().push(id));
    let built = {
        let _guard = BuildGuard;
        Codec::<S>::build()
    };

    let entry = match built {
        Ok(codec) => {
            debug!(record = std::any::type_name::<S>(), "registered codec");
            Registered::Complete(Arc::new(codec))
        }
        Err(err) => Registered::Failed(err),
    };
    REGISTRY.write().entry(id).or_insert(entry);

    lookup::<S>(id).unwrap_or_else(|| {
        Err(CodecError::Registry {
            record: std::any::type_name::<S>().to_string(),
            reason: "codec missing after registration".to_string(),
        })
    })
}
