// oauth2-server-test-utils: shared testing infrastructure.
//
// - `fixtures` builds clients, users and lineage params with unique values
// - `conformance` runs the credential store contract against any backend

pub mod conformance;
pub mod fixtures;

pub use conformance::{run_all, run_user_directory, ConformanceError};
