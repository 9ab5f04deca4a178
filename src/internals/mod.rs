/// "Internals" are the building blocks strategies are assembled from.
/// None of them know which pacing strategy is using them.

pub mod clock;
pub mod sync_pool;
pub mod vsync;
