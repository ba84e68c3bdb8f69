//! Blocking synchronization primitives shared by the executor, the state
//! machine and the guards.

mod semaphore;

pub use semaphore::Semaphore;
