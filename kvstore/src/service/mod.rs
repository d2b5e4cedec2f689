mod builder;
mod kvservice;

pub use builder::ServerBuilder;
pub use kvservice::KVService;
