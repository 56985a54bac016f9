pub mod executor;
pub mod params;
pub mod scheduler;
pub mod slots;
pub mod storage;
pub mod types;

#[cfg(test)]
mod tests;
