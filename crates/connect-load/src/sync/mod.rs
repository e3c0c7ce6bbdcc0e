pub mod stack;

pub use stack::LockFreeStack;
