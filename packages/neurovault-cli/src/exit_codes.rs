pub const SUCCESS: i32 = 0;
/// Store could not be opened or a query failed
pub const EXECUTION_ERROR: i32 = 1;
/// Bad arguments or configuration
pub const INPUT_ERROR: i32 = 2;
/// `verify` found corrupt chunks
pub const CORRUPTION_FOUND: i32 = 3;
/// `cleanup` could not bring usage under the limit
pub const CAPACITY_EXCEEDED: i32 = 4;
