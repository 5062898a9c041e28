//! Layout engine (C5), a direct transliteration of
//! `original_source/.../metadata/layout.cpp`
//! (`get_field_size_and_alignment`, `compute_layout`,
//! `compute_explicit_layout`).

use cil_image::raw::heaps::table::FieldAttributes;

use crate::cache::{ElementKind, MetadataCache};
use crate::class::{Field, InitializedParts};
use crate::error::{RtErr, RtResult};

const POINTER_SIZE: usize = std::mem::size_of::<usize>();

/// `(size, alignment)` for a field's signature. By-ref and all reference
/// kinds report pointer size; a nested value type recursively reports its
/// own fully laid out instance size, read back off the `Class` `cache`
/// registered when the stub was created (spec.md §4.5). The referenced
/// class's `FIELDS` phase must already have completed — value types cannot
/// contain themselves, so a correctly ordered loader always lays out a
/// nested value type before the class that embeds it; a field that reaches
/// this still incomplete is a loader-ordering bug, not a layout one.
pub fn field_size_and_alignment<'l>(cache: &'l MetadataCache<'l>, sig: &crate::cache::TypeSig<'l>) -> RtResult<(usize, usize)> {
	if sig.by_ref {
		return Ok((POINTER_SIZE, POINTER_SIZE));
	}
	Ok(match sig.kind {
		ElementKind::Boolean | ElementKind::I1 | ElementKind::U1 => (1, 1),
		ElementKind::I2 | ElementKind::U2 | ElementKind::Char => (2, 2),
		ElementKind::I4 | ElementKind::U4 | ElementKind::R4 => (4, 4),
		ElementKind::I8 | ElementKind::U8 | ElementKind::R8 => (8, 8),
		ElementKind::TypedByRef => (POINTER_SIZE * 2, POINTER_SIZE),
		ElementKind::ValueType(ty) => {
			let class = cache.lookup_class(ty).ok_or(RtErr::TypeLoad)?;
			if !class.is_initialized(InitializedParts::FIELDS) {
				return Err(RtErr::TypeLoad);
			}
			(class.instance_size().max(1), class.instance_alignment().max(1))
		}
		_ => (POINTER_SIZE, POINTER_SIZE),
	})
}

fn align_up(offset: usize, alignment: usize) -> usize {
	if alignment == 0 {
		return offset;
	}
	(offset + alignment - 1) & !(alignment - 1)
}

/// Sequential layout: fields placed in declaration order starting after the
/// parent's instance size, each aligned to `min(natural, packing)` when
/// `packing != 0`.
pub fn compute_sequential_layout<'l>(
	cache: &'l MetadataCache<'l>,
	fields: &mut [Field<'l>],
	parent_size: usize,
	parent_alignment: usize,
	packing: u16,
) -> RtResult<(usize, usize)> {
	let mut offset = parent_size;
	let mut max_alignment = parent_alignment.max(1);

	for field in fields.iter_mut() {
		if field.flags.contains(FieldAttributes::STATIC) || field.flags.contains(FieldAttributes::LITERAL) {
			continue;
		}
		let (size, natural_alignment) = field_size_and_alignment(cache, field.sig)?;
		let alignment = if packing != 0 { natural_alignment.min(packing as usize) } else { natural_alignment };
		let alignment = alignment.max(1);
		offset = align_up(offset, alignment);
		field.offset = Some(offset as u32);
		offset += size;
		max_alignment = max_alignment.max(alignment);
	}

	Ok((align_up(offset, max_alignment), max_alignment))
}

/// Explicit layout: each field's offset comes from the `FieldLayout` table
/// (`(field_index, offset)` pairs, passed in already joined by the caller).
/// A field with no layout entry is `BadImageFormat`.
pub fn compute_explicit_layout<'l>(cache: &'l MetadataCache<'l>, fields: &mut [Field<'l>], offsets: &[(u32, u32)], packing: u16) -> RtResult<(usize, usize)> {
	let mut total_size = 0usize;
	let mut max_alignment = 1usize;

	for (i, field) in fields.iter_mut().enumerate() {
		if field.flags.contains(FieldAttributes::STATIC) || field.flags.contains(FieldAttributes::LITERAL) {
			continue;
		}
		let &(_, offset) = offsets.iter().find(|(idx, _)| *idx as usize == i).ok_or(RtErr::BadImageFormat)?;
		let (size, natural_alignment) = field_size_and_alignment(cache, field.sig)?;
		let alignment = if packing != 0 { natural_alignment.min(packing as usize) } else { natural_alignment };
		field.offset = Some(offset);
		total_size = total_size.max(offset as usize + size);
		max_alignment = max_alignment.max(alignment.max(1));
	}

	Ok((total_size, max_alignment))
}

#[cfg(test)]
mod tests {
	use bumpalo::Bump;

	use super::*;
	use crate::cache::{ElementKind, SigAttributes, TypeSig};
	use crate::config::EngineConfig;

	fn sig(kind: ElementKind) -> TypeSig {
		TypeSig { kind, by_ref: false, attrs: SigAttributes::empty(), canonical: true }
	}

	#[test]
	fn field_sizes_match_il_primitives() {
		let bump = Bump::new();
		let cache = MetadataCache::new(&bump, &EngineConfig::default());
		assert_eq!(field_size_and_alignment(&cache, &sig(ElementKind::I1)).unwrap(), (1, 1));
		assert_eq!(field_size_and_alignment(&cache, &sig(ElementKind::I4)).unwrap(), (4, 4));
		assert_eq!(field_size_and_alignment(&cache, &sig(ElementKind::I8)).unwrap(), (8, 8));
		assert_eq!(field_size_and_alignment(&cache, &sig(ElementKind::TypedByRef)).unwrap(), (POINTER_SIZE * 2, POINTER_SIZE));
	}

	#[test]
	fn by_ref_is_always_pointer_sized() {
		let bump = Bump::new();
		let cache = MetadataCache::new(&bump, &EngineConfig::default());
		let mut s = sig(ElementKind::I8);
		s.by_ref = true;
		assert_eq!(field_size_and_alignment(&cache, &s).unwrap(), (POINTER_SIZE, POINTER_SIZE));
	}

	#[test]
	fn align_up_rounds_to_next_multiple() {
		assert_eq!(align_up(4, 8), 8);
		assert_eq!(align_up(8, 8), 8);
		assert_eq!(align_up(0, 4), 0);
	}
}
