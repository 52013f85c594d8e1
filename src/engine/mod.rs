pub mod activation;
pub mod dispatcher;
pub mod endpoints;
pub mod normalize;
pub mod sink;
