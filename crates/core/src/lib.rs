pub mod backend;
pub mod cancel;
pub mod config;
pub mod credentials;
pub mod error;
pub mod io;
pub mod pager;
pub mod part;
pub mod path;
pub mod session;

pub use backend::{Backend, BackendKind, copy_streamed};
pub use config::BackendConfig;
pub use error::{BackendError, Result};
pub use pager::PartStream;
pub use part::Part;
