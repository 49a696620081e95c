pub mod surf_logging;
pub mod url_path;

pub use url::Url;
