pub mod expirer;

pub use expirer::Expirer;
