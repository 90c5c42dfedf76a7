mod store;

pub use store::{BackIter, FrontIter, FrontIterMut, ParamStore};
