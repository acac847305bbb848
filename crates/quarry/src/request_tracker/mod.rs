pub use self::node::*;
pub use self::request::*;
pub use self::request_graph::*;
pub use self::request_tracker::*;

mod node;
mod request;
mod request_graph;
mod request_tracker;
mod serialization;
