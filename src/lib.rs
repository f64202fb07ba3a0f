//! Concurrent data structures built on two safe-memory-reclamation
//! schemes (hazard pointers and dynamic/pass-the-buck hazard pointers), a
//! flat-combining kernel for turning sequential containers concurrent,
//! and three lock-free/lock-coupled containers built atop them: a Treiber
//! stack with elimination back-off, Michael's ordered list, the lazy
//! lock-coupled ordered list, and a split-ordered hash set.
//!
//! # Thread lifecycle
//!
//! Every thread that touches a container here must call [`registry::attach`]
//! before its first operation and [`registry::detach`] before it stops
//! using containers (or exits). Forgetting `detach` leaks that thread's
//! slot until process exit; forgetting `attach` surfaces as
//! [`error::CdsError::NotAttached`] from the first container call.
//!
//! # Choosing a reclamation scheme
//!
//! [`hp`] bounds each thread to a fixed number of simultaneous hazard
//! slots, configured once for the whole process. [`dhp`] instead draws
//! guards from a shared pool, so a single thread can hold as many as an
//! operation needs. [`treiber`], [`michael_list`], and [`split_list`] are
//! built on [`hp`]; [`lazy_list`] combines [`hp`] traversal with
//! per-node locking for mutation.

pub mod backoff;
pub mod dhp;
pub mod error;
pub mod flat_combining;
pub mod hp;
pub mod lazy_list;
pub mod michael_list;
pub mod registry;
pub mod retired;
pub mod split_list;
pub mod treiber;

pub use error::{CdsError, Result};
pub use flat_combining::{FcConfig, FlatCombinable, Kernel};
pub use lazy_list::LazyList;
pub use michael_list::MichaelList;
pub use split_list::{SplitListConfig, SplitOrderedSet};
pub use treiber::{TreiberConfig, TreiberStack};
