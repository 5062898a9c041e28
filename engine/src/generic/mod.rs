//! Generic inflation (C4): substituting `Var`/`MVar` type-parameter
//! references with concrete arguments, grounded in
//! `original_source/.../vm/generic_class.cpp` / `generic_method.cpp`'s
//! `inflate_type` walk.

use crate::cache::{ElementKind, GenericInst, MetadataCache, TypeSig};
use crate::error::{RtErr, RtResult};

/// The generic arguments in scope while inflating a signature: the
/// enclosing class's arguments (substituted for `Var`) and, when inflating
/// a generic method body, that method's own arguments (substituted for
/// `MVar`). Either may be absent for a non-generic enclosing scope.
#[derive(Debug, Copy, Clone)]
pub struct InflationContext<'l> {
	pub class_args: Option<&'l GenericInst<'l>>,
	pub method_args: Option<&'l GenericInst<'l>>,
}

impl<'l> InflationContext<'l> {
	pub fn new(class_args: Option<&'l GenericInst<'l>>, method_args: Option<&'l GenericInst<'l>>) -> Self {
		Self { class_args, method_args }
	}

	pub fn none() -> Self {
		Self { class_args: None, method_args: None }
	}
}

/// Substitutes every `Var`/`MVar` occurrence in `sig` via `ctx`, recursing
/// through pointer/array/fn-ptr/nested-generic constructors. A signature
/// with no `Var`/`MVar` anywhere below it is returned unchanged (no
/// allocation).
pub fn inflate_typesig<'l>(
	cache: &'l MetadataCache<'l>,
	sig: &'l TypeSig<'l>,
	ctx: InflationContext<'l>,
) -> RtResult<&'l TypeSig<'l>> {
	let substituted = match sig.kind {
		ElementKind::Var(idx) => Some(resolve_arg(ctx.class_args, idx)?),
		// An `MVar` with no enclosing method instantiation isn't an error
		// (unlike `Var`): a generic method body can itself be inflated for
		// its class's arguments alone, leaving its own type parameters open.
		ElementKind::MVar(idx) => match ctx.method_args {
			Some(args) => Some(resolve_arg(Some(args), idx)?),
			None => None,
		},
		_ => None,
	};
	if let Some(arg) = substituted {
		return Ok(if sig.by_ref { cache.get_pooled_ref(arg) } else { arg });
	}

	match sig.kind {
		ElementKind::Ptr(elem) => {
			let elem = inflate_typesig(cache, elem, ctx)?;
			Ok(cache.get_pooled_ptr(elem))
		}
		ElementKind::SzArray(elem) => {
			let elem = inflate_typesig(cache, elem, ctx)?;
			Ok(cache.get_pooled_szarray(elem))
		}
		ElementKind::Array(elem, rank) => {
			let elem = inflate_typesig(cache, elem, ctx)?;
			Ok(cache.get_pooled_array(elem, rank))
		}
		ElementKind::FnPtr(params, ret) => {
			let params = inflate_slice(cache, params, ctx)?;
			let ret = inflate_typesig(cache, ret, ctx)?;
			Ok(cache.get_fresh(ElementKind::FnPtr(params, ret), sig.by_ref, sig.attrs))
		}
		ElementKind::GenericInst(generic_class) => {
			let inflated = inflate_generic_inst(cache, generic_class.inst, ctx)?;
			if std::ptr::eq(inflated, generic_class.inst) {
				return Ok(sig);
			}
			let gc = cache.get_pooled_generic_class(generic_class.base, inflated);
			Ok(if sig.by_ref { gc.by_ref(cache) } else { gc.by_val(cache) })
		}
		// No Var/MVar below a leaf kind: nothing to substitute.
		_ => Ok(sig),
	}
}

fn resolve_arg<'l>(args: Option<&'l GenericInst<'l>>, idx: u32) -> RtResult<&'l TypeSig<'l>> {
	let args = args.ok_or(RtErr::TypeLoad)?;
	args.args.get(idx as usize).copied().ok_or(RtErr::TypeLoad)
}

fn inflate_slice<'l>(
	cache: &'l MetadataCache<'l>,
	sigs: &'l [&'l TypeSig<'l>],
	ctx: InflationContext<'l>,
) -> RtResult<&'l [&'l TypeSig<'l>]> {
	let inflated: Vec<&'l TypeSig<'l>> = sigs.iter().map(|s| inflate_typesig(cache, s, ctx)).collect::<RtResult<_>>()?;
	if inflated.iter().zip(sigs).all(|(a, b)| std::ptr::eq(*a, *b)) {
		return Ok(sigs);
	}
	Ok(cache.bump().alloc_slice_copy(&inflated))
}

/// Substitutes every argument of `inst` itself (needed when a class's own
/// generic arguments are, in turn, open — e.g. `Box<T>` nested inside
/// `List<T>` while inflating `List<int>`).
pub fn inflate_generic_inst<'l>(
	cache: &'l MetadataCache<'l>,
	inst: &'l GenericInst<'l>,
	ctx: InflationContext<'l>,
) -> RtResult<&'l GenericInst<'l>> {
	let args = inflate_slice(cache, inst.args, ctx)?;
	if std::ptr::eq(args, inst.args) {
		return Ok(inst);
	}
	Ok(cache.get_pooled_generic_inst(args))
}

/// Inflates a method's return type and parameter list as a unit, for
/// building the [`crate::class::Method`] that backs one
/// [`crate::cache::GenericMethod`] instantiation.
pub fn inflate_method_signature<'l>(
	cache: &'l MetadataCache<'l>,
	return_sig: &'l TypeSig<'l>,
	params: &'l [&'l TypeSig<'l>],
	ctx: InflationContext<'l>,
) -> RtResult<(&'l TypeSig<'l>, &'l [&'l TypeSig<'l>])> {
	Ok((inflate_typesig(cache, return_sig, ctx)?, inflate_slice(cache, params, ctx)?))
}

#[cfg(test)]
mod tests {
	use bumpalo::Bump;

	use super::*;
	use crate::config::EngineConfig;

	#[test]
	fn var_substitution_resolves_by_index() {
		let bump = Bump::new();
		let cache = MetadataCache::new(&bump, &EngineConfig::default());
		let int_sig = cache.get_primitive(crate::cache::Primitive::I4);
		let str_sig = cache.get_primitive(crate::cache::Primitive::String);
		let inst = cache.get_pooled_generic_inst(&[int_sig, str_sig]);
		let ctx = InflationContext::new(Some(inst), None);

		let var0 = cache.get_var(0);
		let var1 = cache.get_var(1);
		assert!(std::ptr::eq(inflate_typesig(&cache, var0, ctx).unwrap(), int_sig));
		assert!(std::ptr::eq(inflate_typesig(&cache, var1, ctx).unwrap(), str_sig));
	}

	#[test]
	fn var_without_class_args_is_type_load_error() {
		let bump = Bump::new();
		let cache = MetadataCache::new(&bump, &EngineConfig::default());
		let var0 = cache.get_var(0);
		assert!(inflate_typesig(&cache, var0, InflationContext::none()).is_err());
	}

	#[test]
	fn mvar_without_method_args_is_returned_unchanged() {
		let bump = Bump::new();
		let cache = MetadataCache::new(&bump, &EngineConfig::default());
		let mvar0 = cache.get_mvar(0);
		let out = inflate_typesig(&cache, mvar0, InflationContext::none()).unwrap();
		assert!(std::ptr::eq(mvar0, out));
	}

	#[test]
	fn non_generic_signature_is_returned_unchanged() {
		let bump = Bump::new();
		let cache = MetadataCache::new(&bump, &EngineConfig::default());
		let sig = cache.get_primitive(crate::cache::Primitive::I4);
		let out = inflate_typesig(&cache, sig, InflationContext::none()).unwrap();
		assert!(std::ptr::eq(sig, out));
	}

	#[test]
	fn szarray_of_var_inflates_elementwise() {
		let bump = Bump::new();
		let cache = MetadataCache::new(&bump, &EngineConfig::default());
		let int_sig = cache.get_primitive(crate::cache::Primitive::I4);
		let inst = cache.get_pooled_generic_inst(&[int_sig]);
		let ctx = InflationContext::new(Some(inst), None);

		let arr_of_var = cache.get_pooled_szarray(cache.get_var(0));
		let inflated = inflate_typesig(&cache, arr_of_var, ctx).unwrap();
		let expected = cache.get_pooled_szarray(int_sig);
		assert!(std::ptr::eq(inflated, expected));
	}
}
