mod lqr;
mod unicycle;

pub use lqr::LqrModel;
pub use unicycle::{UnicycleModel, UnicycleSe2Model};
