use crate::raw::indices::metadata_token::MethodDefToken;
use crate::schema::heaps::InternedString;
use crate::schema::r#type::Type;

#[derive(Debug, Copy, Clone)]
pub struct Method<'l> {
	pub(crate) metadata_token: MethodDefToken,
	pub(crate) name: InternedString<'l>,
	pub(crate) body: Option<MethodBody<'l>>,
}

impl<'l> Method<'l> {
	/// Builds a method handle directly, bypassing the MethodDef-table read
	/// path. Meant for callers (tests, `demos`) that build a method graph
	/// without reading it out of a real image.
	pub fn new(metadata_token: MethodDefToken, name: InternedString<'l>, body: Option<MethodBody<'l>>) -> Self {
		Self { metadata_token, name, body }
	}

	#[inline]
	pub fn name(&self) -> InternedString<'l> {
		self.name
	}

	#[inline]
	pub fn metadata_token(&self) -> MethodDefToken {
		self.metadata_token
	}

	#[inline]
	pub fn body(&self) -> Option<&MethodBody<'l>> {
		self.body.as_ref()
	}
}

/// A lowered method body: raw CIL code, its declared locals and the
/// `.maxstack` directive, ready for the two-pass bytecode transformer.
#[derive(Debug, Copy, Clone)]
pub struct MethodBody<'l> {
	pub max_stack_size: u16,
	pub init_locals: bool,
	pub code: &'l [u8],
	pub locals: &'l [&'l Type<'l>],
}
