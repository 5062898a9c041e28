/// Tunables threaded into [`crate::cache::MetadataCache::new`] and
/// [`crate::interp::Interpreter::new`], mirroring how the image crate threads
/// a `&'l Bump`/`DataPool` through constructors instead of reaching for
/// globals.
#[derive(Debug, Copy, Clone)]
pub struct EngineConfig {
	/// Initial size, in bytes, of the bump arena chunk backing the metadata
	/// cache (type signatures, generic instances/classes/methods).
	pub initial_arena_chunk_size: usize,
	/// Per-thread argument/local/eval-stack region size, in stack objects
	/// (see spec §5 — "a contiguous region sized to the current call
	/// chain's requirement plus a reserve").
	pub stack_reserve_objects: usize,
	/// Dispatch strategy for the interpreter's opcode loop (REDESIGN FLAGS
	/// §9: the source hard-wires computed-goto; we keep both available
	/// since the specification requires only identical semantics).
	pub dispatch: DispatchStrategy,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum DispatchStrategy {
	Switch,
	ComputedGoto,
}

impl Default for EngineConfig {
	fn default() -> Self {
		Self {
			initial_arena_chunk_size: 1 << 16,
			stack_reserve_objects: 4096,
			dispatch: DispatchStrategy::Switch,
		}
	}
}
