//! Label keys shared with the out-of-tree collaborators (executor,
//! result collector, janitor). Changing a value here is a wire change.

/// Name of the bulk a calculation belongs to.
pub const BULK: &str = "calc-dispatch.io/bulk";

/// Key of the bulk member a calculation was created from.
pub const CALCULATION_NAME: &str = "calc-dispatch.io/calculation-name";

/// Directory under the shared root where input and output files live.
pub const ROOT_FOLDER: &str = "calc-dispatch.io/root-folder";

/// Worker a calculation is bound to. Mirrors the `assign` field for
/// label-selector lookups.
pub const ASSIGN: &str = "calc-dispatch.io/assign";

/// Name of the factory a generation calculation runs for.
pub const FACTORY: &str = "calc-dispatch.io/factory";

/// Marks the single calculation run after all bulk members finish.
pub const POST_CALCULATION: &str = "calc-dispatch.io/post-calculation";

/// Set by the result collector once output files are persisted.
pub const RESULTS_COLLECTED: &str = "calc-dispatch.io/results-collected";

/// Role of a worker process object.
pub const ROLE: &str = "calc-dispatch.io/role";
pub const ROLE_WORKER: &str = "worker";
