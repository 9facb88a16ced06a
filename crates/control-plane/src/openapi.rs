pub use crate::http::ApiDoc;
