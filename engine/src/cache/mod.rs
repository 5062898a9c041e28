//! Metadata cache (C2): canonicalizes and interns type signatures, generic
//! instances, and generic classes/methods, grounded in
//! `cil_image::schema::r#type::TypePool`'s hash-consing pattern but covering
//! the richer [`TypeSig`] shape spec.md §3 describes (Var/MVar, GenericInst,
//! attribute bits, by-ref) rather than the image crate's load-time `Type`.

use std::cell::RefCell;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};

use bitflags::bitflags;
use bumpalo::Bump;
use cil_image::schema::Method as ImageMethod;
use cil_image::schema::r#type::Type as ImageType;
use fxhash::FxBuildHasher;

use crate::config::EngineConfig;

bitflags! {
	/// Per-field/parameter attribute bits a non-canonical [`TypeSig`] may
	/// carry (spec.md §3: "non-canonical signatures ... are allocated
	/// fresh and not pooled").
	#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
	pub struct SigAttributes: u32 {
		const IN = 0x0001;
		const OUT = 0x0002;
		const OPTIONAL = 0x0010;
		const HAS_DEFAULT = 0x1000;
	}
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum ElementKind<'l> {
	Void,
	Boolean,
	Char,
	I1,
	U1,
	I2,
	U2,
	I4,
	U4,
	I8,
	U8,
	R4,
	R8,
	I,
	U,
	String,
	Object,
	TypedByRef,
	ValueType(&'l ImageType<'l>),
	Class(&'l ImageType<'l>),
	Ptr(&'l TypeSig<'l>),
	SzArray(&'l TypeSig<'l>),
	Array(&'l TypeSig<'l>, u32),
	Var(u32),
	MVar(u32),
	GenericInst(&'l GenericClass<'l>),
	FnPtr(&'l [&'l TypeSig<'l>], &'l TypeSig<'l>),
}

/// A canonicalized (or, if `attrs` is non-empty, deliberately non-pooled)
/// type signature. Structural equality of two canonical signatures implies
/// pointer equality (spec.md §8 invariant 1) — callers must use
/// [`MetadataCache`] to obtain instances rather than constructing them ad hoc.
#[derive(Debug, Copy, Clone)]
pub struct TypeSig<'l> {
	pub kind: ElementKind<'l>,
	pub by_ref: bool,
	pub attrs: SigAttributes,
	pub canonical: bool,
}

impl<'l> TypeSig<'l> {
	pub fn is_canonical(&self) -> bool {
		self.canonical
	}
}

impl Eq for TypeSig<'_> {}

impl PartialEq for TypeSig<'_> {
	fn eq(&self, other: &Self) -> bool {
		if self.canonical && other.canonical {
			return std::ptr::eq(self, other);
		}
		self.kind == other.kind && self.by_ref == other.by_ref && self.attrs == other.attrs
	}
}

impl Hash for TypeSig<'_> {
	fn hash<H: Hasher>(&self, state: &mut H) {
		if self.canonical {
			(self as *const Self).hash(state);
		} else {
			self.kind.hash(state);
			self.by_ref.hash(state);
			self.attrs.hash(state);
		}
	}
}

/// An interned, ordered sequence of canonical argument [`TypeSig`]s.
#[derive(Debug)]
pub struct GenericInst<'l> {
	pub args: &'l [&'l TypeSig<'l>],
}

impl Eq for GenericInst<'_> {}

impl PartialEq for GenericInst<'_> {
	fn eq(&self, other: &Self) -> bool {
		self.args.len() == other.args.len()
			&& self.args.iter().zip(other.args).all(|(a, b)| std::ptr::eq(*a, *b))
	}
}

impl Hash for GenericInst<'_> {
	fn hash<H: Hasher>(&self, state: &mut H) {
		for arg in self.args {
			(*arg as *const TypeSig).hash(state);
		}
	}
}

/// Pair (base type-def, class-level [`GenericInst`]). Spec.md §3: "Carries
/// cached by-val and by-ref TypeSig views."
#[derive(Debug)]
pub struct GenericClass<'l> {
	pub base: &'l ImageType<'l>,
	pub inst: &'l GenericInst<'l>,
	by_val: std::cell::OnceCell<&'l TypeSig<'l>>,
	by_ref: std::cell::OnceCell<&'l TypeSig<'l>>,
}

impl<'l> GenericClass<'l> {
	pub fn by_val(&'l self, cache: &MetadataCache<'l>) -> &'l TypeSig<'l> {
		*self.by_val.get_or_init(|| cache.alloc_sig(TypeSig {
			kind: ElementKind::GenericInst(self),
			by_ref: false,
			attrs: SigAttributes::empty(),
			canonical: true,
		}))
	}

	pub fn by_ref(&'l self, cache: &MetadataCache<'l>) -> &'l TypeSig<'l> {
		*self.by_ref.get_or_init(|| cache.alloc_sig(TypeSig {
			kind: ElementKind::GenericInst(self),
			by_ref: true,
			attrs: SigAttributes::empty(),
			canonical: true,
		}))
	}
}

/// Triple (base method, class-inst, method-inst).
#[derive(Debug)]
pub struct GenericMethod<'l> {
	pub base: &'l ImageMethod<'l>,
	pub class_inst: Option<&'l GenericInst<'l>>,
	pub method_inst: &'l GenericInst<'l>,
}

impl Eq for GenericMethod<'_> {}

impl PartialEq for GenericMethod<'_> {
	fn eq(&self, other: &Self) -> bool {
		std::ptr::eq(self.base, other.base)
			&& self.class_inst.map(|i| i as *const _) == other.class_inst.map(|i| i as *const _)
			&& std::ptr::eq(self.method_inst, other.method_inst)
	}
}

impl Hash for GenericMethod<'_> {
	fn hash<H: Hasher>(&self, state: &mut H) {
		(self.base as *const ImageMethod).hash(state);
		self.class_inst.map(|i| i as *const GenericInst).hash(state);
		(self.method_inst as *const GenericInst).hash(state);
	}
}

type InternMap<K, V> = RefCell<HashMap<K, V, FxBuildHasher>>;

/// Hash-consing store for every canonical [`TypeSig`]/[`GenericInst`]/
/// [`GenericClass`]/[`GenericMethod`] observed during a run. Entries are
/// never removed (spec.md §9: "no entry is ever removed").
pub struct MetadataCache<'l> {
	bump: &'l Bump,
	primitives: [std::cell::OnceCell<&'l TypeSig<'l>>; PRIMITIVE_COUNT],
	value_types: InternMap<*const ImageType<'l>, &'l TypeSig<'l>>,
	class_types: InternMap<*const ImageType<'l>, &'l TypeSig<'l>>,
	ptrs: InternMap<*const TypeSig<'l>, &'l TypeSig<'l>>,
	refs: InternMap<*const TypeSig<'l>, &'l TypeSig<'l>>,
	szarrays: InternMap<*const TypeSig<'l>, &'l TypeSig<'l>>,
	arrays: InternMap<(*const TypeSig<'l>, u32), &'l TypeSig<'l>>,
	vars: InternMap<u32, &'l TypeSig<'l>>,
	mvars: InternMap<u32, &'l TypeSig<'l>>,
	generic_insts: InternMap<Vec<*const TypeSig<'l>>, &'l GenericInst<'l>>,
	generic_classes: InternMap<(*const ImageType<'l>, *const GenericInst<'l>), &'l GenericClass<'l>>,
	generic_methods: InternMap<(*const ImageMethod<'l>, Option<*const GenericInst<'l>>, *const GenericInst<'l>), &'l GenericMethod<'l>>,
	/// `ImageType` -> resolved [`crate::class::Class`], self-populated by
	/// `Class::new_stub_with_array_shape`. Lets the layout engine (C5) look a
	/// nested value type's `Class` back up from its raw `ElementKind::ValueType`
	/// signature without a separate loader table.
	classes: InternMap<*const ImageType<'l>, &'l crate::class::Class<'l>>,
}

const PRIMITIVE_COUNT: usize = 17;

#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
#[repr(usize)]
pub enum Primitive {
	Void = 0,
	Boolean,
	Char,
	I1,
	U1,
	I2,
	U2,
	I4,
	U4,
	I8,
	U8,
	R4,
	R8,
	I,
	U,
	String,
	Object,
}

impl<'l> MetadataCache<'l> {
	pub fn new(bump: &'l Bump, _config: &EngineConfig) -> Self {
		Self {
			bump,
			primitives: std::array::from_fn(|_| std::cell::OnceCell::new()),
			value_types: Default::default(),
			class_types: Default::default(),
			ptrs: Default::default(),
			refs: Default::default(),
			szarrays: Default::default(),
			arrays: Default::default(),
			vars: Default::default(),
			mvars: Default::default(),
			generic_insts: Default::default(),
			generic_classes: Default::default(),
			generic_methods: Default::default(),
			classes: Default::default(),
		}
	}

	fn alloc_sig(&'l self, sig: TypeSig<'l>) -> &'l TypeSig<'l> {
		self.bump.alloc(sig)
	}

	/// The arena backing every signature/inst this cache hands out. Exposed
	/// for callers (e.g. generic inflation) that need to allocate slices of
	/// already-canonical signatures alongside it.
	pub fn bump(&self) -> &'l Bump {
		self.bump
	}

	pub fn get_primitive(&'l self, prim: Primitive) -> &'l TypeSig<'l> {
		self.primitives[prim as usize].get_or_init(|| {
			let kind = match prim {
				Primitive::Void => ElementKind::Void,
				Primitive::Boolean => ElementKind::Boolean,
				Primitive::Char => ElementKind::Char,
				Primitive::I1 => ElementKind::I1,
				Primitive::U1 => ElementKind::U1,
				Primitive::I2 => ElementKind::I2,
				Primitive::U2 => ElementKind::U2,
				Primitive::I4 => ElementKind::I4,
				Primitive::U4 => ElementKind::U4,
				Primitive::I8 => ElementKind::I8,
				Primitive::U8 => ElementKind::U8,
				Primitive::R4 => ElementKind::R4,
				Primitive::R8 => ElementKind::R8,
				Primitive::I => ElementKind::I,
				Primitive::U => ElementKind::U,
				Primitive::String => ElementKind::String,
				Primitive::Object => ElementKind::Object,
			};
			self.alloc_sig(TypeSig { kind, by_ref: false, attrs: SigAttributes::empty(), canonical: true })
		})
	}

	pub fn get_value_type(&'l self, ty: &'l ImageType<'l>) -> &'l TypeSig<'l> {
		let mut map = self.value_types.borrow_mut();
		*map.entry(ty as *const _).or_insert_with(|| {
			self.alloc_sig(TypeSig { kind: ElementKind::ValueType(ty), by_ref: false, attrs: SigAttributes::empty(), canonical: true })
		})
	}

	pub fn get_class(&'l self, ty: &'l ImageType<'l>) -> &'l TypeSig<'l> {
		let mut map = self.class_types.borrow_mut();
		*map.entry(ty as *const _).or_insert_with(|| {
			self.alloc_sig(TypeSig { kind: ElementKind::Class(ty), by_ref: false, attrs: SigAttributes::empty(), canonical: true })
		})
	}

	/// The by-ref (`&T`) view of an already-canonical by-val signature,
	/// pooled separately so `&Foo` and `Foo` remain pointer-distinct.
	pub fn get_pooled_ref(&'l self, by_val: &'l TypeSig<'l>) -> &'l TypeSig<'l> {
		let mut map = self.refs.borrow_mut();
		*map.entry(by_val as *const _).or_insert_with(|| {
			self.alloc_sig(TypeSig { kind: by_val.kind, by_ref: true, attrs: SigAttributes::empty(), canonical: true })
		})
	}

	pub fn get_pooled_ptr(&'l self, elem: &'l TypeSig<'l>) -> &'l TypeSig<'l> {
		let mut map = self.ptrs.borrow_mut();
		*map.entry(elem as *const _).or_insert_with(|| {
			self.alloc_sig(TypeSig { kind: ElementKind::Ptr(elem), by_ref: false, attrs: SigAttributes::empty(), canonical: true })
		})
	}

	pub fn get_pooled_szarray(&'l self, elem: &'l TypeSig<'l>) -> &'l TypeSig<'l> {
		let mut map = self.szarrays.borrow_mut();
		*map.entry(elem as *const _).or_insert_with(|| {
			self.alloc_sig(TypeSig { kind: ElementKind::SzArray(elem), by_ref: false, attrs: SigAttributes::empty(), canonical: true })
		})
	}

	pub fn get_pooled_array(&'l self, elem: &'l TypeSig<'l>, rank: u32) -> &'l TypeSig<'l> {
		let mut map = self.arrays.borrow_mut();
		*map.entry((elem as *const _, rank)).or_insert_with(|| {
			self.alloc_sig(TypeSig { kind: ElementKind::Array(elem, rank), by_ref: false, attrs: SigAttributes::empty(), canonical: true })
		})
	}

	pub fn get_var(&'l self, idx: u32) -> &'l TypeSig<'l> {
		let mut map = self.vars.borrow_mut();
		*map.entry(idx).or_insert_with(|| {
			self.alloc_sig(TypeSig { kind: ElementKind::Var(idx), by_ref: false, attrs: SigAttributes::empty(), canonical: true })
		})
	}

	pub fn get_mvar(&'l self, idx: u32) -> &'l TypeSig<'l> {
		let mut map = self.mvars.borrow_mut();
		*map.entry(idx).or_insert_with(|| {
			self.alloc_sig(TypeSig { kind: ElementKind::MVar(idx), by_ref: false, attrs: SigAttributes::empty(), canonical: true })
		})
	}

	/// Allocates a non-canonical signature carrying field/parameter
	/// attribute bits. Never pooled (spec.md §3).
	pub fn get_fresh(&'l self, kind: ElementKind<'l>, by_ref: bool, attrs: SigAttributes) -> &'l TypeSig<'l> {
		self.bump.alloc(TypeSig { kind, by_ref, attrs, canonical: false })
	}

	pub fn get_pooled_generic_inst(&'l self, args: &[&'l TypeSig<'l>]) -> &'l GenericInst<'l> {
		let key: Vec<*const TypeSig<'l>> = args.iter().map(|a| *a as *const _).collect();
		let mut map = self.generic_insts.borrow_mut();
		*map.entry(key).or_insert_with(|| {
			let args = self.bump.alloc_slice_copy(args);
			self.bump.alloc(GenericInst { args })
		})
	}

	pub fn get_pooled_generic_class(&'l self, base: &'l ImageType<'l>, inst: &'l GenericInst<'l>) -> &'l GenericClass<'l> {
		let mut map = self.generic_classes.borrow_mut();
		*map.entry((base as *const _, inst as *const _)).or_insert_with(|| {
			self.bump.alloc(GenericClass {
				base,
				inst,
				by_val: std::cell::OnceCell::new(),
				by_ref: std::cell::OnceCell::new(),
			})
		})
	}

	pub fn get_pooled_generic_method(
		&'l self,
		base: &'l ImageMethod<'l>,
		class_inst: Option<&'l GenericInst<'l>>,
		method_inst: &'l GenericInst<'l>,
	) -> &'l GenericMethod<'l> {
		let key = (base as *const _, class_inst.map(|i| i as *const _), method_inst as *const _);
		let mut map = self.generic_methods.borrow_mut();
		*map.entry(key).or_insert_with(|| {
			self.bump.alloc(GenericMethod { base, class_inst, method_inst })
		})
	}

	/// Registers the resolved `Class` for `ty`, called once by
	/// `Class::new_stub_with_array_shape`. A second registration for the
	/// same `ty` is ignored rather than overwritten.
	pub fn register_class(&'l self, ty: &'l ImageType<'l>, class: &'l crate::class::Class<'l>) {
		self.classes.borrow_mut().entry(ty as *const _).or_insert(class);
	}

	/// Looks up the `Class` previously registered for `ty`, if any.
	pub fn lookup_class(&'l self, ty: &'l ImageType<'l>) -> Option<&'l crate::class::Class<'l>> {
		self.classes.borrow().get(&(ty as *const _)).copied()
	}
}
