// kiln-net/src/lib.rs
pub mod extract;
pub mod git;
pub mod http;
pub mod validation;

pub use extract::{extract_archive, flatten_single_dir, is_archive};
pub use git::clone_repo;
pub use http::fetch_source_archive;
pub use kiln_common::{
    error::{KilnError, Result},
    Config,
};
pub use validation::{sha256_file, validate_url, verify_checksum};
