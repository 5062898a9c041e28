use std::fmt::{Debug, Formatter};

use cil_image::schema::ReadError;

/// Error kinds the core can produce while loading metadata, laying out
/// classes, lowering bytecode or executing it (spec. §7).
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum RtErr {
	BadImageFormat,
	TypeLoad,
	FileLoad,
	MethodAccess,
	FieldAccess,
	MissingField,
	MissingMethod,
	MissingMember,
	InvalidCast,
	NullReference,
	ArgumentNull,
	Argument,
	ArgumentOutOfRange,
	IndexOutOfRange,
	ArrayTypeMismatch,
	OutOfMemory,
	StackOverflow,
	Overflow,
	DivideByZero,
	ArithmeticException,
	TypeInitialization,
	ExecutionEngine,
	NotImplemented,
	NotSupported,
}

impl std::fmt::Display for RtErr {
	fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
		Debug::fmt(self, f)
	}
}

impl std::error::Error for RtErr {}

impl From<ReadError> for RtErr {
	fn from(_: ReadError) -> Self {
		RtErr::BadImageFormat
	}
}

impl From<std::io::Error> for RtErr {
	fn from(_: std::io::Error) -> Self {
		RtErr::BadImageFormat
	}
}

pub type RtResult<T> = Result<T, RtErr>;
