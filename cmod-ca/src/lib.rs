//! cmod-ca library interface
//!
//! Comment analyzer: keeps a dynamically rendered comment stream in sync with
//! a remote classifier's verdicts and the reader's overrides.

pub mod classifier;
pub mod debounce;
pub mod dom;
pub mod error;
pub mod identity;
pub mod overrides;
pub mod queue;
pub mod reconcile;
pub mod registry;
pub mod runtime;

pub use crate::classifier::{Classifier, HttpClassifier};
pub use crate::error::{Error, Result};
pub use crate::identity::{CommentId, IdentityDeriver};
pub use crate::reconcile::Reconciler;
pub use crate::runtime::{CommentModerator, UserAction};
