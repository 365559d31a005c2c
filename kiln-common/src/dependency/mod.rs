pub mod definition;
pub mod resolver;

pub use definition::{Dependency, DependencyTag, Strength};
pub use resolver::{DependencyResolver, ResolutionContext};
