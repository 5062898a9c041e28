use crate::raw::indices::metadata_token::{MetadataToken, StringToken};
use std::collections::HashMap;
use std::alloc::Layout;
use std::fmt::{Debug, Display, Formatter};
use std::ops::Deref;
use std::pin::Pin;
use bumpalo::Bump;
use derivative::Derivative;
use fxhash::FxHashMap;

use crate::schema::r#type::TypePool;

pub(crate) struct StringHeap<'l> {
	bump: &'l Bump,
	offset: usize,
	vec: Vec<InternedString<'l>>,
	map: FxHashMap<&'l str, usize>,
}

impl<'l> StringHeap<'l> {
	pub fn new(bump: &'l Bump) -> Self {
		let mut heap = Self {
			bump,
			offset: 0,
			vec: vec![],
			map: HashMap::default(),
		};
		heap.intern("");
		heap
	}

	pub fn intern(&mut self, str: &str) -> InternedString<'l> {
		if let Some(idx) = self.map.get(str) {
			return self.vec[*idx];
		}

		let (interned, offset) = unsafe { // Allocate str + zero termination character
			let layout = Layout::array::<u8>(str.len() + 1).unwrap();
			let ptr = self.bump.alloc_layout(layout);
			let interned = std::slice::from_raw_parts_mut(ptr.as_ptr(), layout.size());
			interned[..str.len()].copy_from_slice(str.as_bytes());
			interned[str.len()] = 0;
			let str = std::str::from_utf8_unchecked(&interned[..str.len()]);
			let new_offset = self.offset + layout.size();
			let offset = std::mem::replace(&mut self.offset, new_offset);
			(str, offset)
		};

		let idx = self.vec.len();
		let string = InternedString(interned, StringToken(offset).into());
		self.vec.push(string);
		self.map.insert(interned, idx);
		string
	}
}

impl Debug for StringHeap<'_> {
	fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
		use std::fmt::Write;
		let mut dbg = f.debug_struct("StringHeap");
		let mut name = String::new();
		for str in &self.vec {
			name.clear();
			write!(name, "{:X}", str.1.raw())?;
			dbg.field(&name, &str.0);
		}
		dbg.finish()
	}
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub struct InternedString<'l>(&'l str, MetadataToken);

impl Deref for InternedString<'_> {
	type Target = str;
	#[inline]
	fn deref(&self) -> &Self::Target {
		self.0
	}
}

impl Display for InternedString<'_> {
	#[inline]
	fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
		Display::fmt(self.0, f)
	}
}

impl<'l> InternedString<'l> {
	/// Builds an interned-string handle directly from an already-allocated
	/// `&'l str` and the token it would have had in a `#Strings` heap.
	/// Bypasses `StringHeap::intern`'s dedup/arena bookkeeping; meant for
	/// callers (tests, `demos`) that build a type/method graph without
	/// reading it out of a real heap.
	pub fn new(s: &'l str, token: MetadataToken) -> Self {
		Self(s, token)
	}

	#[inline]
	pub fn metadata_token(&self) -> MetadataToken {
		self.1
	}

	#[inline]
	pub fn as_str(&self) -> &'l str {
		self.0
	}
}

pub(crate) struct BlobHeap<'l> {
	bump: &'l Bump,
	vec: Vec<&'l [u8]>,
	map: FxHashMap<&'l [u8], usize>,
}

impl<'l> BlobHeap<'l> {
	pub fn new(bump: &'l Bump) -> Self {
		Self {
			bump,
			vec: vec![],
			map: HashMap::default(),
		}
	}

	pub fn intern(&mut self, bytes: &[u8]) -> &'l [u8] {
		if let Some(idx) = self.map.get(bytes) {
			return self.vec[*idx];
		}

		let interned = self.bump.alloc_slice_copy(bytes);
		let idx = self.vec.len();
		self.vec.push(interned);
		self.map.insert(interned, idx);
		interned
	}
}

impl Debug for BlobHeap<'_> {
	fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("BlobHeap").field("blobs", &self.vec.len()).finish()
	}
}

/// Owns the arena backing every structured handle (`Type`, `Method`, interned
/// strings and blobs) read out of an [`Assembly`](crate::schema::assembly::Assembly).
///
/// A single pool may back several assemblies that reference each other's types,
/// which is why type interning lives here rather than on `Assembly` itself.
#[derive(Derivative)]
#[derivative(Debug)]
pub struct DataPool<'l> {
	#[derivative(Debug = "ignore")]
	bump: Pin<Box<Bump>>,
	types: TypePool<'l>,
}

impl<'l> Default for DataPool<'l> {
	fn default() -> Self {
		let bump = Pin::new(Box::new(Bump::new()));
		let bump_ref: &'l Bump = unsafe { std::mem::transmute(&*bump) };
		Self {
			bump,
			types: TypePool::new(bump_ref),
		}
	}
}

impl<'l> DataPool<'l> {
	pub fn new() -> Self {
		Self::default()
	}

	#[inline]
	pub(crate) fn bump(&self) -> &'l Bump {
		unsafe { std::mem::transmute(&*self.bump) }
	}

	#[inline]
	pub fn types(&'l self) -> &'l TypePool<'l> {
		&self.types
	}
}
