mod json;
mod text;

pub use json::print_json;
pub use text::print_summary;
