//! Class loader (C3): lazy, per-phase initialization of classes, grounded in
//! `original_source/.../vm/class.h`'s `InitializedParts` gate
//! (`has_initialized_part`/`try_set_initialized_part`) and in the teacher's
//! `TypePool::declare_types` two-step "allocate stub, fill in later" pattern.

pub mod assignability;
pub mod layout;
pub mod vtable;

use std::cell::{Cell, OnceCell};

use bitflags::bitflags;
use bumpalo::Bump;
use cil_image::raw::heaps::table::{FieldAttributes, MethodAttributes};
use cil_image::schema::Method as ImageMethod;
use cil_image::schema::r#type::{Type as ImageType, TypeKind as ImageTypeKind};
use derivative::Derivative;

use crate::cache::{MetadataCache, TypeSig};
use crate::error::{RtErr, RtResult};
use crate::il::InterpMethodInfo;

bitflags! {
	/// Phase-completion gate on a [`Class`] (spec.md §4.2). A phase is
	/// entered by a compare-and-set on this bitmap; re-entry once set is a
	/// no-op, re-entry *during* the same phase (a load cycle) is a
	/// `TypeLoad` failure.
	#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
	pub struct InitializedParts: u32 {
		const SUPER_TYPES    = 1 << 0;
		const INTERFACES     = 1 << 1;
		const NESTED_CLASSES = 1 << 2;
		const FIELDS         = 1 << 3;
		const METHODS        = 1 << 4;
		const PROPERTIES     = 1 << 5;
		const EVENTS         = 1 << 6;
		const VTABLES        = 1 << 7;
	}
}

bitflags! {
	#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
	pub struct ClassFlags: u32 {
		const INTERFACE        = 1 << 0;
		const ABSTRACT         = 1 << 1;
		const SEALED           = 1 << 2;
		const VALUE_TYPE       = 1 << 3;
		const GENERIC_DEF      = 1 << 4;
		const EXPLICIT_LAYOUT  = 1 << 5;
		const ENUM             = 1 << 6;
		const NULLABLE         = 1 << 7;
		const HAS_REFERENCES   = 1 << 8;
		const BLITTABLE        = 1 << 9;
	}
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum Family {
	Object,
	ValueType,
	Enum,
	Delegate,
	MulticastDelegate,
	Array,
	String,
	ByRefLike,
	Other,
}

#[derive(Derivative)]
#[derivative(Debug)]
pub struct Class<'l> {
	#[derivative(Debug = "ignore")]
	pub image_type: &'l ImageType<'l>,
	#[derivative(Debug = "ignore")]
	cache: &'l MetadataCache<'l>,
	pub namespace: &'l str,
	pub name: &'l str,

	pub by_val: &'l TypeSig<'l>,
	pub by_ref: OnceCell<&'l TypeSig<'l>>,
	pub element_class: Option<&'l Class<'l>>,
	pub cast_class: Cell<Option<&'l Class<'l>>>,

	parent: OnceCell<Option<&'l Class<'l>>>,
	family: Cell<Family>,
	flags: Cell<ClassFlags>,
	pub array_rank: u32,

	interfaces: OnceCell<&'l [&'l Class<'l>]>,
	nested_classes: OnceCell<&'l [&'l Class<'l>]>,
	fields: OnceCell<&'l [Field<'l>]>,
	methods: OnceCell<&'l [Method<'l>]>,
	properties: OnceCell<&'l [Property<'l>]>,
	events: OnceCell<&'l [Event<'l>]>,

	vtable: OnceCell<&'l [vtable::VirtualInvokeData<'l>]>,
	interface_offsets: OnceCell<&'l [(&'l Class<'l>, usize)]>,

	instance_size: Cell<usize>,
	instance_alignment: Cell<usize>,
	static_blob: OnceCell<*mut [u8]>,

	in_progress: Cell<InitializedParts>,
	initialized: Cell<InitializedParts>,
	cctor_finished: Cell<bool>,
	#[derivative(Debug = "ignore")]
	cctor_lock: std::sync::Mutex<()>,
}

#[derive(Debug, Copy, Clone)]
pub struct Field<'l> {
	pub owner: &'l Class<'l>,
	pub name: &'l str,
	pub sig: &'l TypeSig<'l>,
	pub flags: FieldAttributes,
	/// Byte offset within the instance, or within the static-field blob for
	/// `static` fields. `None` for literal fields (read from the constant
	/// heap instead, spec.md §3).
	pub offset: Option<u32>,
}

/// Reflective metadata only; spec.md §4.2's `initialize_properties` phase
/// just records back-pointers to the accessor methods already produced by
/// `initialize_methods` (indices into `Class::methods()`), it does not
/// itself add dispatchable behavior.
#[derive(Debug, Copy, Clone)]
pub struct Property<'l> {
	pub owner: &'l Class<'l>,
	pub name: &'l str,
	pub sig: &'l TypeSig<'l>,
	pub getter: Option<usize>,
	pub setter: Option<usize>,
}

/// As [`Property`], for `initialize_events`.
#[derive(Debug, Copy, Clone)]
pub struct Event<'l> {
	pub owner: &'l Class<'l>,
	pub name: &'l str,
	pub handler_sig: &'l TypeSig<'l>,
	pub add: Option<usize>,
	pub remove: Option<usize>,
	pub raise: Option<usize>,
}

/// One `MethodImpl` row (spec.md §4.3 step 3): `body` is substituted for
/// `declaration`'s vtable slot regardless of the name/signature match
/// `build_vtable`'s ordinary override search uses, the mechanism C#
/// explicit interface implementations and covariant-return overrides rely
/// on.
#[derive(Debug, Copy, Clone)]
pub struct MethodImpl<'l> {
	pub declaration: &'l Method<'l>,
	pub body: &'l Method<'l>,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum InvokerKind {
	Interpreter,
	InterpreterVirtualAdjustThunk,
	InternalCall,
	Intrinsic,
	PInvoke,
	RuntimeImpl,
	NewObjFast,
	NewObjArray,
	NotImplemented,
}

#[derive(Derivative)]
#[derivative(Debug)]
pub struct Method<'l> {
	#[derivative(Debug = "ignore")]
	pub image_method: &'l ImageMethod<'l>,
	pub owner: &'l Class<'l>,
	pub name: &'l str,
	pub return_sig: &'l TypeSig<'l>,
	pub params: &'l [&'l TypeSig<'l>],
	pub flags: MethodAttributes,
	pub invoker: InvokerKind,
	slot: Cell<Option<u32>>,
	#[derivative(Debug = "ignore")]
	interp_info: OnceCell<&'l InterpMethodInfo<'l>>,
}

impl<'l> Method<'l> {
	pub fn new(
		image_method: &'l ImageMethod<'l>,
		owner: &'l Class<'l>,
		name: &'l str,
		return_sig: &'l TypeSig<'l>,
		params: &'l [&'l TypeSig<'l>],
		flags: MethodAttributes,
		invoker: InvokerKind,
	) -> Self {
		Self {
			image_method,
			owner,
			name,
			return_sig,
			params,
			flags,
			invoker,
			slot: Cell::new(None),
			interp_info: OnceCell::new(),
		}
	}

	pub fn is_virtual(&self) -> bool {
		self.flags.contains(MethodAttributes::VIRTUAL)
	}

	pub fn is_new_slot(&self) -> bool {
		self.flags.contains(MethodAttributes::NEW_SLOT)
	}

	pub fn slot(&self) -> Option<u32> {
		self.slot.get()
	}

	pub fn set_slot(&self, slot: u32) {
		self.slot.set(Some(slot));
	}

	pub fn interp_info(&self) -> Option<&'l InterpMethodInfo<'l>> {
		self.interp_info.get().copied()
	}

	pub fn set_interp_info(&self, info: &'l InterpMethodInfo<'l>) {
		// First writer wins; lowering is idempotent so a race just does
		// redundant work, never produces divergent results.
		let _ = self.interp_info.set(info);
	}

	/// Total argument stack-object footprint (`this` included when
	/// non-static), used by the interpreter for stack-budget checks.
	pub fn arg_stack_object_size(&self, ptr_size: usize) -> usize {
		let this_slot = usize::from(!self.flags.contains(MethodAttributes::STATIC));
		this_slot + self.params.iter().map(|p| stack_object_count(p, ptr_size)).sum::<usize>()
	}

	pub fn return_stack_object_size(&self, ptr_size: usize) -> usize {
		stack_object_count(self.return_sig, ptr_size)
	}
}

/// `ceil(size / pointer-size)`, capped at 1 for anything pointer-sized or
/// smaller (spec glossary: "Stack object").
fn stack_object_count(sig: &TypeSig, ptr_size: usize) -> usize {
	use crate::cache::ElementKind::*;
	let byte_size = match sig.kind {
		Void => return 0,
		I1 | U1 | Boolean => 1,
		I2 | U2 | Char => 2,
		I4 | U4 | R4 => 4,
		I8 | U8 | R8 => 8,
		TypedByRef => ptr_size * 2,
		_ => ptr_size,
	};
	byte_size.div_ceil(ptr_size).max(1)
}

impl<'l> Class<'l> {
	pub fn new_stub(
		bump: &'l Bump,
		cache: &'l MetadataCache<'l>,
		image_type: &'l ImageType<'l>,
		namespace: &'l str,
		name: &'l str,
		is_value_type: bool,
	) -> &'l Class<'l> {
		Self::new_stub_with_array_shape(bump, cache, image_type, namespace, name, is_value_type, None, 0)
	}

	/// As [`Class::new_stub`], additionally populating `element_class`/
	/// `array_rank` up front for an array class (spec.md §8 invariant 9/S6:
	/// the array store check reads the actual array's element class off its
	/// header, which in turn comes from here — the loader would fill these
	/// in from the array `TypeSpec` it built the class for).
	pub fn new_stub_with_array_shape(
		bump: &'l Bump,
		cache: &'l MetadataCache<'l>,
		image_type: &'l ImageType<'l>,
		namespace: &'l str,
		name: &'l str,
		is_value_type: bool,
		element_class: Option<&'l Class<'l>>,
		array_rank: u32,
	) -> &'l Class<'l> {
		let mut flags = match image_type.kind() {
			ImageTypeKind::Interface => ClassFlags::INTERFACE,
			_ => ClassFlags::empty(),
		};
		if is_value_type {
			flags |= ClassFlags::VALUE_TYPE;
		}

		let by_val = if is_value_type { cache.get_value_type(image_type) } else { cache.get_class(image_type) };

		let class = bump.alloc(Class {
			image_type,
			cache,
			namespace,
			name,
			by_val,
			by_ref: OnceCell::new(),
			element_class,
			cast_class: Cell::new(None),
			parent: OnceCell::new(),
			family: Cell::new(Family::Other),
			flags: Cell::new(flags),
			array_rank,
			interfaces: OnceCell::new(),
			nested_classes: OnceCell::new(),
			fields: OnceCell::new(),
			methods: OnceCell::new(),
			properties: OnceCell::new(),
			events: OnceCell::new(),
			vtable: OnceCell::new(),
			interface_offsets: OnceCell::new(),
			instance_size: Cell::new(0),
			instance_alignment: Cell::new(1),
			static_blob: OnceCell::new(),
			in_progress: Cell::new(InitializedParts::empty()),
			initialized: Cell::new(InitializedParts::empty()),
			cctor_finished: Cell::new(false),
			cctor_lock: std::sync::Mutex::new(()),
		});
		cache.register_class(image_type, class);
		class
	}

	pub fn flags(&self) -> ClassFlags {
		self.flags.get()
	}

	pub fn family(&self) -> Family {
		self.family.get()
	}

	pub fn is_value_type(&self) -> bool {
		self.flags.get().contains(ClassFlags::VALUE_TYPE)
	}

	pub fn parent(&self) -> Option<&'l Class<'l>> {
		self.parent.get().copied().flatten()
	}

	pub fn interfaces(&self) -> &'l [&'l Class<'l>] {
		self.interfaces.get().copied().unwrap_or(&[])
	}

	pub fn fields(&self) -> &'l [Field<'l>] {
		self.fields.get().copied().unwrap_or(&[])
	}

	pub fn methods(&self) -> &'l [Method<'l>] {
		self.methods.get().copied().unwrap_or(&[])
	}

	pub fn properties(&self) -> &'l [Property<'l>] {
		self.properties.get().copied().unwrap_or(&[])
	}

	pub fn events(&self) -> &'l [Event<'l>] {
		self.events.get().copied().unwrap_or(&[])
	}

	pub fn vtable(&self) -> &'l [vtable::VirtualInvokeData<'l>] {
		self.vtable.get().copied().unwrap_or(&[])
	}

	pub fn interface_offsets(&self) -> &'l [(&'l Class<'l>, usize)] {
		self.interface_offsets.get().copied().unwrap_or(&[])
	}

	pub fn instance_size(&self) -> usize {
		self.instance_size.get()
	}

	pub fn instance_alignment(&self) -> usize {
		self.instance_alignment.get()
	}

	/// Raw bytes backing this class's static fields, if any were declared.
	///
	/// # Safety
	/// Callers must not alias this with another live `&mut` access to the
	/// same blob; field reads/writes go through the offsets in [`Field`].
	pub unsafe fn static_blob(&self) -> Option<*mut [u8]> {
		self.static_blob.get().copied()
	}

	pub fn is_initialized(&self, part: InitializedParts) -> bool {
		self.initialized.get().contains(part)
	}

	/// Enters `part`'s phase gate: `Ok(true)` if the caller should run the
	/// phase body, `Ok(false)` if it already ran. `Err` on re-entrant load
	/// cycles (spec.md §4.2).
	fn enter_phase(&self, part: InitializedParts) -> RtResult<bool> {
		if self.initialized.get().contains(part) {
			return Ok(false);
		}
		if self.in_progress.get().contains(part) {
			return Err(RtErr::TypeLoad);
		}
		self.in_progress.set(self.in_progress.get() | part);
		Ok(true)
	}

	fn finish_phase(&self, part: InitializedParts) {
		self.in_progress.set(self.in_progress.get() & !part);
		self.initialized.set(self.initialized.get() | part);
	}

	#[cfg_attr(feature = "tracing", tracing::instrument(skip_all))]
	pub fn initialize_super_types(&'l self, resolve_parent: impl FnOnce() -> RtResult<Option<&'l Class<'l>>>) -> RtResult<()> {
		if !self.enter_phase(InitializedParts::SUPER_TYPES)? {
			return Ok(());
		}
		let parent = resolve_parent()?;
		let family = match parent {
			None => Family::Object,
			Some(p) => match (p.namespace, p.name) {
				("System", "ValueType") => Family::ValueType,
				("System", "Enum") => Family::Enum,
				("System", "MulticastDelegate") => Family::MulticastDelegate,
				("System", "Delegate") => Family::Delegate,
				("System", "Array") => Family::Array,
				("System", "String") => Family::String,
				_ => p.family(),
			},
		};
		self.family.set(family);
		if matches!(family, Family::ValueType | Family::Enum) {
			self.flags.set(self.flags.get() | ClassFlags::VALUE_TYPE);
		}
		let _ = self.parent.set(parent);
		self.finish_phase(InitializedParts::SUPER_TYPES);
		Ok(())
	}

	#[cfg_attr(feature = "tracing", tracing::instrument(skip_all))]
	pub fn initialize_interfaces(
		&'l self,
		bump: &'l Bump,
		declared: impl FnOnce() -> RtResult<Vec<&'l Class<'l>>>,
	) -> RtResult<()> {
		if !self.enter_phase(InitializedParts::INTERFACES)? {
			return Ok(());
		}
		let mut list = declared()?;
		list.sort_by_key(|c| *c as *const Class as usize);
		list.dedup_by_key(|c| *c as *const Class as usize);
		for iface in &list {
			iface.initialize_super_types(|| Ok(iface.parent()))?;
		}
		let _ = self.interfaces.set(bump.alloc_slice_copy(&list));
		self.finish_phase(InitializedParts::INTERFACES);
		Ok(())
	}

	#[cfg_attr(feature = "tracing", tracing::instrument(skip_all))]
	pub fn initialize_nested_classes(
		&'l self,
		bump: &'l Bump,
		nested: impl FnOnce() -> RtResult<Vec<&'l Class<'l>>>,
	) -> RtResult<()> {
		if !self.enter_phase(InitializedParts::NESTED_CLASSES)? {
			return Ok(());
		}
		let list = nested()?;
		let _ = self.nested_classes.set(bump.alloc_slice_copy(&list));
		self.finish_phase(InitializedParts::NESTED_CLASSES);
		Ok(())
	}

	#[cfg_attr(feature = "tracing", tracing::instrument(skip_all))]
	pub fn initialize_fields(
		&'l self,
		bump: &'l Bump,
		declared: impl FnOnce() -> RtResult<Vec<Field<'l>>>,
		explicit_layout: Option<&[(u32, u32)]>,
		class_size: Option<u32>,
		packing: u16,
	) -> RtResult<()> {
		if !self.enter_phase(InitializedParts::FIELDS)? {
			return Ok(());
		}
		let mut fields = declared()?;
		let parent_size = self.parent().map(|p| p.instance_size()).unwrap_or(0);
		let parent_align = self.parent().map(|p| p.instance_alignment()).unwrap_or(1);

		let (size, alignment) = if self.flags.get().contains(ClassFlags::EXPLICIT_LAYOUT) {
			let offsets = explicit_layout.ok_or(RtErr::BadImageFormat)?;
			layout::compute_explicit_layout(self.cache, &mut fields, offsets, packing)?
		} else {
			layout::compute_sequential_layout(self.cache, &mut fields, parent_size, parent_align, packing)?
		};

		let size = class_size.map(|s| s as usize).unwrap_or(size).max(size);
		self.instance_size.set(size);
		self.instance_alignment.set(alignment);

		if fields.iter().any(|f| f.flags.contains(FieldAttributes::STATIC)) {
			let static_size: usize = fields
				.iter()
				.filter(|f| f.flags.contains(FieldAttributes::STATIC))
				.map(|f| f.offset.map(|_| 8).unwrap_or(0))
				.sum();
			let blob = bump.alloc_slice_fill_copy(static_size.max(1), 0u8) as *mut [u8];
			let _ = self.static_blob.set(blob);
		}

		let has_refs = fields.iter().any(|f| is_reference_like(f.sig));
		if has_refs {
			self.flags.set(self.flags.get() | ClassFlags::HAS_REFERENCES);
		}

		let _ = self.fields.set(bump.alloc_slice_clone(&fields));
		self.finish_phase(InitializedParts::FIELDS);
		Ok(())
	}

	#[cfg_attr(feature = "tracing", tracing::instrument(skip_all))]
	pub fn initialize_methods(&'l self, bump: &'l Bump, declared: impl FnOnce() -> RtResult<Vec<Method<'l>>>) -> RtResult<()> {
		if !self.enter_phase(InitializedParts::METHODS)? {
			return Ok(());
		}
		let methods = declared()?;
		let mut methods = methods.into_iter();
		let len = methods.len();
		let _ = self.methods.set(bump.alloc_slice_fill_with(len, |_| methods.next().unwrap()));
		self.finish_phase(InitializedParts::METHODS);
		Ok(())
	}

	#[cfg_attr(feature = "tracing", tracing::instrument(skip_all))]
	pub fn initialize_properties(&'l self, bump: &'l Bump, declared: impl FnOnce() -> RtResult<Vec<Property<'l>>>) -> RtResult<()> {
		if !self.enter_phase(InitializedParts::PROPERTIES)? {
			return Ok(());
		}
		let props = declared()?;
		let _ = self.properties.set(bump.alloc_slice_clone(&props));
		self.finish_phase(InitializedParts::PROPERTIES);
		Ok(())
	}

	#[cfg_attr(feature = "tracing", tracing::instrument(skip_all))]
	pub fn initialize_events(&'l self, bump: &'l Bump, declared: impl FnOnce() -> RtResult<Vec<Event<'l>>>) -> RtResult<()> {
		if !self.enter_phase(InitializedParts::EVENTS)? {
			return Ok(());
		}
		let events = declared()?;
		let _ = self.events.set(bump.alloc_slice_clone(&events));
		self.finish_phase(InitializedParts::EVENTS);
		Ok(())
	}

	#[cfg_attr(feature = "tracing", tracing::instrument(skip_all))]
	pub fn initialize_vtables(&'l self, bump: &'l Bump, method_impls: impl FnOnce() -> RtResult<Vec<MethodImpl<'l>>>) -> RtResult<()> {
		if !self.enter_phase(InitializedParts::VTABLES)? {
			return Ok(());
		}
		if !self.is_initialized(InitializedParts::METHODS) || !self.is_initialized(InitializedParts::INTERFACES) {
			return Err(RtErr::ExecutionEngine);
		}
		let method_impls = method_impls()?;
		let (vtbl, offsets) = vtable::build_vtable(bump, self, &method_impls)?;
		let _ = self.vtable.set(vtbl);
		let _ = self.interface_offsets.set(offsets);
		self.finish_phase(InitializedParts::VTABLES);
		Ok(())
	}

	/// Drives the static constructor at most once per class (spec.md
	/// §4.2/§8 invariant 8). `run` executes the cctor body; callers that
	/// lose the race block on the same mutex and observe the post-state.
	pub fn run_cctor_once(&self, run: impl FnOnce() -> RtResult<()>) -> RtResult<()> {
		if self.cctor_finished.get() {
			return Ok(());
		}
		let _guard = self.cctor_lock.lock().unwrap();
		if self.cctor_finished.get() {
			return Ok(());
		}
		run()?;
		self.cctor_finished.set(true);
		Ok(())
	}
}

fn is_reference_like(sig: &TypeSig) -> bool {
	use crate::cache::ElementKind::*;
	matches!(sig.kind, Class(_) | String | Object | SzArray(_) | Array(..) | Ptr(_)) || sig.by_ref
}
