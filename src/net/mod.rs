pub mod multicast;
pub mod tcp;
