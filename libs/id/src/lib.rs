//! # mp-id
//!
//! Identity for the proxy's runtime objects.
//!
//! Two kinds of identity live here:
//!
//! - **Session ids** are system generated, prefixed ULIDs
//!   (`ses_01HV4Z2WQXKJNM8GPQY6VBKC3D`). They sort by creation time and are
//!   never reused.
//! - **Names** are user-facing labels for rules, rulelists, routes, clusters,
//!   listeners and sessions. When a definition omits its name, a
//!   [`NameAllocator`] hands out `Kind_<n>` defaults. The allocator is owned
//!   by whoever owns the registry, so two engines in one process never share
//!   counters.

mod error;
mod macros;
mod names;

pub use error::IdError;
pub use names::{unique_name, NameAllocator, NameKind, MAX_NAME_SUFFIX};

/// Re-export ulid for consumers that need raw ULID operations
pub use ulid::Ulid;

define_id!(SessionId, "ses");
