//! Subject identification and credential verification.
//! Keep the public surface thin and split implementation across sub-modules.

mod subject;
mod credentials;
mod resolver;

pub use subject::Subject;
pub use credentials::{Credentials, ProcTable};
pub use resolver::{CredentialSource, SubjectResolver};
