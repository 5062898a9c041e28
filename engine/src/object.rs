//! Object model (C10): header/body layout, allocation, boxing/unboxing,
//! array creation, string encoding, grounded in spec.md §4.10 and
//! `original_source/.../vm/object.h` / `array.h` / `string.h`. Every heap
//! value lives in the same bump arena as metadata (`&'l Bump`), matching
//! the teacher's "no process-wide allocator, everything threaded through
//! an arena" convention — a real implementation would back this with a GC
//! heap instead, out of scope here (spec.md §1/§5).

use std::cell::Cell;

use bumpalo::Bump;

use crate::class::Class;
use crate::error::{RtErr, RtResult};

/// Every heap object starts with this header (spec.md §5: "identity is a
/// hash in the object header"). `identity_hash` is assigned lazily on
/// first `GetHashCode`/monitor use, `0` meaning "unassigned".
#[repr(C)]
pub struct ObjectHeader<'l> {
	pub class: &'l Class<'l>,
	pub identity_hash: Cell<u32>,
}

pub const HEADER_SIZE: usize = std::mem::size_of::<ObjectHeader>();

/// A reference to heap-allocated object bytes. The header occupies the
/// first [`HEADER_SIZE`] bytes; [`object_body`] gives the instance bytes
/// that follow.
pub type ObjectRef<'l> = &'l [u8];

fn write_header<'l>(bytes: &mut [u8], class: &'l Class<'l>) {
	debug_assert!(bytes.len() >= HEADER_SIZE);
	unsafe {
		(bytes.as_mut_ptr() as *mut ObjectHeader<'l>).write(ObjectHeader { class, identity_hash: Cell::new(0) });
	}
}

pub fn object_class<'l>(obj: &[u8]) -> &'l Class<'l> {
	unsafe { (*(obj.as_ptr() as *const ObjectHeader<'l>)).class }
}

pub fn object_body(obj: &[u8]) -> &[u8] {
	&obj[HEADER_SIZE..]
}

pub fn object_body_mut(obj: &mut [u8]) -> &mut [u8] {
	&mut obj[HEADER_SIZE..]
}

/// `new_object(class)`: reserves `object_header + instance_size`, sets the
/// header's class pointer, zero-fills the body (spec.md §4.10).
pub fn new_object<'l>(bump: &'l Bump, class: &'l Class<'l>) -> &'l mut [u8] {
	let total = HEADER_SIZE + class.instance_size();
	let bytes = bump.alloc_slice_fill_copy(total, 0u8);
	write_header(bytes, class);
	bytes
}

/// `box_object(class, data)`: allocates and copies the value bits after
/// the header.
pub fn box_value<'l>(bump: &'l Bump, class: &'l Class<'l>, data: &[u8]) -> RtResult<&'l mut [u8]> {
	if !class.is_value_type() {
		return Err(RtErr::Argument);
	}
	let obj = new_object(bump, class);
	let body = object_body_mut(obj);
	let n = data.len().min(body.len());
	body[..n].copy_from_slice(&data[..n]);
	Ok(obj)
}

/// Returns a pointer to the boxed value's bits, checking class equality
/// for type safety (`InvalidCast` on mismatch, spec.md §4.10).
pub fn unbox<'l>(obj: &[u8], expected: &'l Class<'l>) -> RtResult<&[u8]> {
	let actual = object_class::<'l>(obj);
	if !std::ptr::eq(actual, expected) {
		return Err(RtErr::InvalidCast);
	}
	Ok(object_body(obj))
}

/// SZ (single-dimension, zero-based) array header: length then element
/// bits inline.
#[repr(C)]
pub struct SzArrayHeader<'l> {
	pub object: ObjectHeader<'l>,
	pub length: u32,
}

pub const SZ_ARRAY_HEADER_SIZE: usize = std::mem::size_of::<SzArrayHeader>();

pub fn new_sz_array<'l>(bump: &'l Bump, array_class: &'l Class<'l>, length: u32, elem_size: usize) -> &'l mut [u8] {
	let total = SZ_ARRAY_HEADER_SIZE + length as usize * elem_size;
	let bytes = bump.alloc_slice_fill_copy(total, 0u8);
	unsafe {
		(bytes.as_mut_ptr() as *mut SzArrayHeader<'l>).write(SzArrayHeader { object: ObjectHeader { class: array_class, identity_hash: Cell::new(0) }, length });
	}
	bytes
}

pub fn sz_array_length(arr: &[u8]) -> u32 {
	unsafe { (*(arr.as_ptr() as *const SzArrayHeader)).length }
}

pub fn sz_array_elements(arr: &[u8]) -> &[u8] {
	&arr[SZ_ARRAY_HEADER_SIZE..]
}

pub fn sz_array_elements_mut(arr: &mut [u8]) -> &mut [u8] {
	&mut arr[SZ_ARRAY_HEADER_SIZE..]
}

pub fn sz_array_element<'a>(arr: &'a [u8], index: u32, elem_size: usize) -> RtResult<&'a [u8]> {
	if index >= sz_array_length(arr) {
		return Err(RtErr::IndexOutOfRange);
	}
	let start = index as usize * elem_size;
	Ok(&sz_array_elements(arr)[start..start + elem_size])
}

pub fn sz_array_element_mut<'a>(arr: &'a mut [u8], index: u32, elem_size: usize) -> RtResult<&'a mut [u8]> {
	if index >= sz_array_length(arr) {
		return Err(RtErr::IndexOutOfRange);
	}
	let start = index as usize * elem_size;
	Ok(&mut sz_array_elements_mut(arr)[start..start + elem_size])
}

/// Multi-rank array header: per-dimension `(length, lower_bound)` pairs
/// follow immediately after this fixed part, then element data.
#[repr(C)]
pub struct MultiArrayHeader<'l> {
	pub object: ObjectHeader<'l>,
	pub rank: u32,
}

pub const MULTI_ARRAY_HEADER_SIZE: usize = std::mem::size_of::<MultiArrayHeader>();

pub fn new_multi_array<'l>(bump: &'l Bump, array_class: &'l Class<'l>, dims: &[(i32, i32)], elem_size: usize) -> RtResult<&'l mut [u8]> {
	let total_elements: i64 = dims.iter().try_fold(1i64, |acc, &(len, _)| {
		if len < 0 {
			return None;
		}
		Some(acc * len as i64)
	}).ok_or(RtErr::ArgumentOutOfRange)?;

	let dims_size = dims.len() * std::mem::size_of::<(i32, i32)>();
	let total = MULTI_ARRAY_HEADER_SIZE + dims_size + total_elements as usize * elem_size;
	let bytes = bump.alloc_slice_fill_copy(total, 0u8);
	unsafe {
		(bytes.as_mut_ptr() as *mut MultiArrayHeader<'l>).write(MultiArrayHeader { object: ObjectHeader { class: array_class, identity_hash: Cell::new(0) }, rank: dims.len() as u32 });
		let dims_ptr = bytes[MULTI_ARRAY_HEADER_SIZE..].as_mut_ptr() as *mut (i32, i32);
		for (i, d) in dims.iter().enumerate() {
			dims_ptr.add(i).write(*d);
		}
	}
	Ok(bytes)
}

pub fn multi_array_rank(arr: &[u8]) -> u32 {
	unsafe { (*(arr.as_ptr() as *const MultiArrayHeader)).rank }
}

pub fn multi_array_dims(arr: &[u8]) -> &[(i32, i32)] {
	let rank = multi_array_rank(arr) as usize;
	unsafe { std::slice::from_raw_parts(arr[MULTI_ARRAY_HEADER_SIZE..].as_ptr() as *const (i32, i32), rank) }
}

fn multi_array_elements_offset(rank: usize) -> usize {
	MULTI_ARRAY_HEADER_SIZE + rank * std::mem::size_of::<(i32, i32)>()
}

pub fn multi_array_element<'a>(arr: &'a [u8], indices: &[i32], elem_size: usize) -> RtResult<&'a [u8]> {
	let dims = multi_array_dims(arr);
	if indices.len() != dims.len() {
		return Err(RtErr::Argument);
	}
	let mut flat = 0usize;
	for (&(len, lower), &idx) in dims.iter().zip(indices) {
		let rel = idx - lower;
		if rel < 0 || rel >= len {
			return Err(RtErr::IndexOutOfRange);
		}
		flat = flat * len as usize + rel as usize;
	}
	let start = multi_array_elements_offset(dims.len()) + flat * elem_size;
	Ok(&arr[start..start + elem_size])
}

/// UTF-16 string body: a length prefix then inline char data, with a
/// fixed `OffsetToStringData` (spec.md §4.10/§6) identifying the first
/// code unit.
#[repr(C)]
pub struct StringHeader<'l> {
	pub object: ObjectHeader<'l>,
	pub length: u32,
}

pub const STRING_HEADER_SIZE: usize = std::mem::size_of::<StringHeader>();
pub const OFFSET_TO_STRING_DATA: usize = STRING_HEADER_SIZE;

pub fn new_string<'l>(bump: &'l Bump, string_class: &'l Class<'l>, s: &str) -> &'l mut [u8] {
	let units: Vec<u16> = s.encode_utf16().collect();
	let total = STRING_HEADER_SIZE + units.len() * 2;
	let bytes = bump.alloc_slice_fill_copy(total, 0u8);
	unsafe {
		(bytes.as_mut_ptr() as *mut StringHeader<'l>).write(StringHeader { object: ObjectHeader { class: string_class, identity_hash: Cell::new(0) }, length: units.len() as u32 });
		let char_ptr = bytes[OFFSET_TO_STRING_DATA..].as_mut_ptr() as *mut u16;
		for (i, u) in units.iter().enumerate() {
			char_ptr.add(i).write(*u);
		}
	}
	bytes
}

pub fn string_length(s: &[u8]) -> u32 {
	unsafe { (*(s.as_ptr() as *const StringHeader)).length }
}

pub fn string_chars(s: &[u8]) -> &[u16] {
	let len = string_length(s) as usize;
	unsafe { std::slice::from_raw_parts(s[OFFSET_TO_STRING_DATA..].as_ptr() as *const u16, len) }
}

pub fn string_to_utf8(s: &[u8]) -> String {
	String::from_utf16_lossy(string_chars(s))
}

fn array_element_size(array_class: &Class) -> usize {
	match array_class.element_class {
		Some(e) if e.is_value_type() => e.instance_size().max(std::mem::size_of::<usize>()),
		_ => std::mem::size_of::<usize>(),
	}
}

/// Reconstructs an [`ObjectRef`] from a raw pointer recovered out of a
/// pointer-sized stack slot. The interpreter's frame storage only has room
/// for one pointer-sized slot per reference (spec.md §5: a reference is an
/// opaque address, same footprint as any other stack object), so the full
/// byte range backing an `ObjectRef` has to be recovered here by reading
/// the header's class and, for arrays and strings, their length field.
///
/// # Safety
/// `ptr` must be null or point at the start of a live object this arena
/// allocated.
pub unsafe fn object_ref_from_ptr<'l>(ptr: *const u8) -> Option<ObjectRef<'l>> {
	if ptr.is_null() {
		return None;
	}
	let class = (*(ptr as *const ObjectHeader)).class;
	let total = match class.family() {
		crate::class::Family::Array if class.array_rank <= 1 => {
			let length = (*(ptr as *const SzArrayHeader)).length as usize;
			SZ_ARRAY_HEADER_SIZE + length * array_element_size(class)
		}
		crate::class::Family::Array => {
			let rank = (*(ptr as *const MultiArrayHeader)).rank as usize;
			let dims = std::slice::from_raw_parts(ptr.add(MULTI_ARRAY_HEADER_SIZE) as *const (i32, i32), rank);
			let count: usize = dims.iter().map(|&(len, _)| len.max(0) as usize).product();
			multi_array_elements_offset(rank) + count * array_element_size(class)
		}
		crate::class::Family::String => {
			let length = (*(ptr as *const StringHeader)).length as usize;
			STRING_HEADER_SIZE + length * 2
		}
		_ => HEADER_SIZE + class.instance_size(),
	};
	Some(std::slice::from_raw_parts(ptr, total))
}

/// Tagged handle produced by `ldtoken` (spec.md §6 names the type; the
/// encoding scheme is grounded in `module_def.h`'s `encode_gid_by_rid` /
/// `decode_rid_from_gid`, here represented directly as a sum type instead
/// of a packed gid integer since this crate never serializes handles back
/// into image bytes).
#[derive(Debug, Copy, Clone)]
pub enum RuntimeHandle<'l> {
	Type(&'l Class<'l>),
	Method(&'l crate::class::Method<'l>),
	Field(&'l Class<'l>, usize),
}

#[cfg(test)]
mod tests {
	use bumpalo::Bump;

	use super::*;

	// These tests write the header's length field directly at `HEADER_SIZE`
	// rather than going through `new_string`/`new_sz_array`, since building
	// a real `Class<'_>` needs a loaded `ImageType` not available to a unit
	// test; the layout itself (ObjectHeader followed by a `u32` length) is
	// exactly what those constructors assume.

	#[test]
	fn utf16_round_trip_preserves_text() {
		let bump = Bump::new();
		let s = "hi";
		let units: Vec<u16> = s.encode_utf16().collect();
		let total = STRING_HEADER_SIZE + units.len() * 2;
		let bytes = bump.alloc_slice_fill_copy(total, 0u8);
		unsafe {
			*(bytes.as_mut_ptr().add(HEADER_SIZE) as *mut u32) = units.len() as u32;
			let char_ptr = bytes[OFFSET_TO_STRING_DATA..].as_mut_ptr() as *mut u16;
			for (i, u) in units.iter().enumerate() {
				char_ptr.add(i).write(*u);
			}
		}
		assert_eq!(string_to_utf8(bytes), "hi");
	}

	#[test]
	fn sz_array_bounds_check_rejects_out_of_range_index() {
		let bump = Bump::new();
		let bytes = bump.alloc_slice_fill_copy(SZ_ARRAY_HEADER_SIZE + 4, 0u8);
		unsafe {
			*(bytes.as_mut_ptr().add(HEADER_SIZE) as *mut u32) = 1;
		}
		assert!(sz_array_element(bytes, 0, 4).is_ok());
		assert!(sz_array_element(bytes, 1, 4).is_err());
	}
}
