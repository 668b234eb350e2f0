mod goal;
mod offer;
mod operation;
mod resource;
mod spec;
mod task;

pub use goal::*;
pub use offer::*;
pub use operation::*;
pub use resource::*;
pub use spec::*;
pub use task::*;
