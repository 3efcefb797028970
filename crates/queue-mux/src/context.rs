//! Per-message propagation context.
//!
//! Every message travelling through a [`QueueHandler`](crate::QueueHandler)
//! carries a [`MessageContext`]. The context holds two independent pieces of
//! state:
//!
//! - **Correlation metadata** ([`PublishOptions`]): immutable once the context
//!   is built. The correlation ID links a published message to whatever
//!   consumes it on the other side of the broker.
//! - **Disposition** ([`Disposition`]): a mutable, shared record that a
//!   handler can use to override the backend's acknowledgement decision via
//!   [`MessageContext::set_message_delete`]. Clones of a context share the
//!   same disposition, so a decision made inside a handler is visible to the
//!   backend loop that inspects it once the handler chain has finished.
//!
//! # Examples
//!
//! ```rust
//! use queue_mux::context::{MessageContext, PublishOptions};
//!
//! let opts = PublishOptions::merge([
//!     PublishOptions::with_correlation_id("one"),
//!     PublishOptions::with_correlation_id("two"),
//! ]);
//! let ctx = MessageContext::new().with_options(opts);
//! assert_eq!(ctx.correlation_id(), "two");
//! ```

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

#[cfg(test)]
#[path = "context_tests.rs"]
mod tests;

// ============================================================================
// Publish Options
// ============================================================================

/// Options applied to a message when it is published.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PublishOptions {
    /// Explicit correlation ID. `None` leaves any existing ID in place.
    pub correlation_id: Option<String>,
}

impl PublishOptions {
    /// Set an explicit correlation ID.
    pub fn with_correlation_id(correlation_id: impl Into<String>) -> Self {
        Self {
            correlation_id: Some(correlation_id.into()),
        }
    }

    /// Carry the correlation ID of an existing message context forward.
    ///
    /// Used by consumers that publish follow-up messages so the downstream
    /// consumer sees the same correlation ID.
    pub fn with_correlation_id_from(ctx: &MessageContext) -> Self {
        Self {
            correlation_id: ctx.options.correlation_id.clone(),
        }
    }

    /// Merge option sets left to right. The last non-empty correlation ID wins.
    pub fn merge<I>(options: I) -> Self
    where
        I: IntoIterator<Item = PublishOptions>,
    {
        options
            .into_iter()
            .fold(PublishOptions::default(), |mut merged, opt| {
                if let Some(id) = opt.correlation_id.filter(|id| !id.is_empty()) {
                    merged.correlation_id = Some(id);
                }
                merged
            })
    }
}

/// Shorthand for [`PublishOptions::with_correlation_id`].
pub fn with_correlation_id(correlation_id: impl Into<String>) -> PublishOptions {
    PublishOptions::with_correlation_id(correlation_id)
}

// ============================================================================
// Disposition
// ============================================================================

const DISPOSITION_UNSET: u8 = 0;
const DISPOSITION_KEEP: u8 = 1;
const DISPOSITION_DELETE: u8 = 2;

/// Mutable acknowledgement override shared by every clone of a context.
///
/// Unset by default; backends then fall back to delete-on-success.
#[derive(Debug, Clone)]
pub struct Disposition(Arc<AtomicU8>);

impl Default for Disposition {
    fn default() -> Self {
        Self(Arc::new(AtomicU8::new(DISPOSITION_UNSET)))
    }
}

impl Disposition {
    /// Force (`true`) or suppress (`false`) deletion of the message.
    pub fn set_delete(&self, should_delete: bool) {
        let value = if should_delete {
            DISPOSITION_DELETE
        } else {
            DISPOSITION_KEEP
        };
        self.0.store(value, Ordering::SeqCst);
    }

    /// The override, if a handler set one.
    pub fn delete_override(&self) -> Option<bool> {
        match self.0.load(Ordering::SeqCst) {
            DISPOSITION_DELETE => Some(true),
            DISPOSITION_KEEP => Some(false),
            _ => None,
        }
    }

    /// Resolve the final delete decision for a processed message.
    ///
    /// The override wins over the handler chain's result when it is set.
    pub fn should_delete(&self, processed_ok: bool) -> bool {
        self.delete_override().unwrap_or(processed_ok)
    }
}

// ============================================================================
// Message Context
// ============================================================================

/// Context bound to a single in-flight message.
#[derive(Debug, Clone, Default)]
pub struct MessageContext {
    options: PublishOptions,
    disposition: Disposition,
}

impl MessageContext {
    /// Create a context with a freshly generated correlation ID.
    pub fn new() -> Self {
        Self::from_options(PublishOptions::with_correlation_id(
            uuid::Uuid::new_v4().to_string(),
        ))
    }

    /// Create a context carrying exactly the given options.
    pub fn from_options(options: PublishOptions) -> Self {
        Self {
            options,
            disposition: Disposition::default(),
        }
    }

    /// Merge additional options into this context's metadata.
    pub fn with_options(mut self, options: PublishOptions) -> Self {
        self.options = PublishOptions::merge([self.options, options]);
        self
    }

    /// The correlation ID, or an empty string when none was propagated.
    pub fn correlation_id(&self) -> &str {
        self.options.correlation_id.as_deref().unwrap_or_default()
    }

    /// Publish options carried by this context.
    pub fn options(&self) -> &PublishOptions {
        &self.options
    }

    /// The shared acknowledgement override.
    pub fn disposition(&self) -> &Disposition {
        &self.disposition
    }

    /// Override the backend's delete decision for this message.
    pub fn set_message_delete(&self, should_delete: bool) {
        self.disposition.set_delete(should_delete);
    }

    /// The delete override and whether it was set.
    pub fn message_delete(&self) -> Option<bool> {
        self.disposition.delete_override()
    }
}

/// Shorthand for [`MessageContext::set_message_delete`].
pub fn set_message_delete(ctx: &MessageContext, should_delete: bool) {
    ctx.set_message_delete(should_delete);
}
