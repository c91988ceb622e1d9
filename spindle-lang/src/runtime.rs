//! Types that are used at runtime: values, the pool that stores them, and the
//! native function libraries.

pub mod io;
pub mod list;
pub mod math;
pub mod native;
pub mod pointer;
pub mod pool;
pub mod symbol;
pub mod time;
pub mod value;
