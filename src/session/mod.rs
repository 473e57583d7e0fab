pub mod manager;
pub mod profile;

pub use manager::{Session, SessionManager};
pub use profile::{ClientProfile, HeaderOverrides};
