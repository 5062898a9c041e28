//! End-to-end scenarios (spec.md §8): hand-built metadata graphs and raw
//! CIL bodies driven straight through `il::lower_method` and
//! `interp::Interpreter`, without a real PE image anywhere in the loop.
//! Every class is built through `Class::new_stub`/`declare_class`, the
//! construction path those two call out as existing for exactly this
//! purpose (see their doc comments).

use std::collections::HashMap;

use bumpalo::Bump;
use cil_image::raw::heaps::table::{FieldAttributes, MethodAttributes};
use cil_image::raw::indices::metadata_token::{MethodDefToken, StringToken};
use cil_image::schema::r#type::TypeKind as ImageTypeKind;
use cil_image::schema::{DataPool, InternedString, Method as ImageMethod, MethodBody};

use cil_engine::cache::{MetadataCache, Primitive};
use cil_engine::class::{Class, Field, InvokerKind, Method, MethodImpl};
use cil_engine::config::EngineConfig;
use cil_engine::error::{RtErr, RtResult};
use cil_engine::il::{lower_method, ExceptionClauseKind, RawClause, ResolvedToken, TokenResolver};
use cil_engine::interp::{ExecOutcome, Interpreter, Value};
use cil_engine::object;

/// Maps a token-bearing opcode's 4-byte operand straight to its resolved
/// member, standing in for the MemberRef/TypeSpec walk a real image reader
/// would do (out of this crate's scope, per `il::lower_method`'s doc comment).
struct MapResolver<'l> {
	map: HashMap<u32, ResolvedToken<'l>>,
}

impl<'l> MapResolver<'l> {
	fn new() -> Self {
		Self { map: HashMap::new() }
	}

	fn with(mut self, token: u32, resolved: ResolvedToken<'l>) -> Self {
		self.map.insert(token, resolved);
		self
	}
}

impl<'l> TokenResolver<'l> for MapResolver<'l> {
	fn resolve(&self, token: u32) -> RtResult<ResolvedToken<'l>> {
		self.map.get(&token).copied().ok_or(RtErr::MissingMember)
	}
}

/// Builds the image-level method handle a `cil_engine::class::Method` needs
/// to point at; its `code`/`locals` are decorative here since
/// `il::lower_method` takes the raw bytes and local signatures as separate
/// parameters rather than reading them back off this struct.
fn image_method<'l>(bump: &'l Bump, token: usize, name: &'static str, code: &'l [u8], max_stack: u16) -> &'l ImageMethod<'l> {
	let body = MethodBody { max_stack_size: max_stack, init_locals: true, code, locals: &[] };
	bump.alloc(ImageMethod::new(MethodDefToken(token), InternedString::new(name, StringToken(token).into()), Some(body)))
}

fn assert_returned_i8(outcome: ExecOutcome, expected: i64) {
	match outcome {
		ExecOutcome::Returned(Some(Value::I8(v))) => assert_eq!(v, expected),
		ExecOutcome::Returned(other) => panic!("unexpected return value: {other:?}"),
		ExecOutcome::Threw(_) => panic!("method threw unexpectedly"),
	}
}

fn assert_returned_none(outcome: ExecOutcome) {
	match outcome {
		ExecOutcome::Returned(None) => {}
		ExecOutcome::Returned(Some(v)) => panic!("expected a void return, got {v:?}"),
		ExecOutcome::Threw(_) => panic!("method threw unexpectedly"),
	}
}

/// S1: an iterative loop (locals, backward branch, a forward exit branch)
/// computing the 10th Fibonacci number, exercising LdcI4/Ldloc/Stloc/Add/
/// BrCompare/Br/Ret end to end with no metadata tokens at all.
#[test]
fn s1_iterative_fibonacci_loop() {
	let bump = Bump::new();
	let config = EngineConfig::default();
	let cache = MetadataCache::new(&bump, &config);
	let pool = DataPool::new();
	let types = pool.types();

	let i4 = cache.get_primitive(Primitive::I4);
	let void = cache.get_primitive(Primitive::Void);

	let owner_ty = types.declare_class("Demo", "Fib", ImageTypeKind::Class, false);
	let owner = Class::new_stub(&bump, &cache, owner_ty, "Demo", "Fib", false);
	owner.initialize_super_types(|| Ok(None)).unwrap();
	owner.initialize_interfaces(&bump, || Ok(vec![])).unwrap();
	owner.initialize_fields(&bump, || Ok(vec![]), None, None, 0).unwrap();

	// a=0; b=1; i=0;
	// LOOP: if (i >= 10) goto END; t=a+b; a=b; b=t; i=i+1; goto LOOP;
	// END: return a;
	#[rustfmt::skip]
	let code: &[u8] = &[
		0x16,       // 0:  ldc.i4.0
		0x0A,       // 1:  stloc.0 (a)
		0x17,       // 2:  ldc.i4.1
		0x0B,       // 3:  stloc.1 (b)
		0x16,       // 4:  ldc.i4.0
		0x0C,       // 5:  stloc.2 (i)
		0x08,       // 6:  ldloc.2 (i)      -- LOOP
		0x1F, 0x0A, // 7:  ldc.i4.s 10
		0x2F, 0x0E, // 9:  bge.s +14 -> 25 (END)
		0x06,       // 11: ldloc.0 (a)
		0x07,       // 12: ldloc.1 (b)
		0x58,       // 13: add
		0x0D,       // 14: stloc.3 (t)
		0x07,       // 15: ldloc.1 (b)
		0x0A,       // 16: stloc.0 (a = b)
		0x09,       // 17: ldloc.3 (t)
		0x0B,       // 18: stloc.1 (b = t)
		0x08,       // 19: ldloc.2 (i)
		0x17,       // 20: ldc.i4.1
		0x58,       // 21: add
		0x0C,       // 22: stloc.2 (i = i + 1)
		0x2B, 0xED, // 23: br.s -19 -> 6 (LOOP)
		0x06,       // 25: ldloc.0 (a)       -- END
		0x2A,       // 26: ret
	];

	let image_md = image_method(&bump, 1, "Compute", code, 4);
	let method = bump.alloc(Method::new(image_md, owner, "Compute", i4, &[], MethodAttributes::PUBLIC | MethodAttributes::STATIC, InvokerKind::Interpreter));
	let _ = void;

	let resolver = MapResolver::new();
	let locals = bump.alloc_slice_copy(&[i4, i4, i4, i4]);
	let info = lower_method(&bump, method, code, locals, true, &[], &resolver).unwrap();
	method.set_interp_info(bump.alloc(info));

	let interp = Interpreter::new(&bump, config);
	let outcome = interp.invoke(method, &[]).unwrap();
	assert_returned_i8(outcome, 55);
}

/// S2: a three-class hierarchy (`ObjectBase` <- `A` <- `B`) where `A`
/// declares a new-slot virtual `M` and `B` overrides it without `newslot`;
/// a driver body does `newobj B::.ctor` then `callvirt A::M`, exercising
/// `build_vtable`'s override search against the object's *actual* class.
#[test]
fn s2_virtual_dispatch_picks_the_override() {
	let bump = Bump::new();
	let config = EngineConfig::default();
	let cache = MetadataCache::new(&bump, &config);
	let pool = DataPool::new();
	let types = pool.types();

	let i4 = cache.get_primitive(Primitive::I4);
	let void = cache.get_primitive(Primitive::Void);

	// A ctor/B ctor bodies are just `ret`; this hierarchy never chains to
	// its base constructor (see DESIGN.md).
	let ctor_code: &[u8] = &[0x2A];

	let object_base_ty = types.declare_class("Demo", "ObjectBase", ImageTypeKind::Class, false);
	let object_base = Class::new_stub(&bump, &cache, object_base_ty, "Demo", "ObjectBase", false);
	object_base.initialize_super_types(|| Ok(None)).unwrap();
	object_base.initialize_interfaces(&bump, || Ok(vec![])).unwrap();
	object_base.initialize_fields(&bump, || Ok(vec![]), None, None, 0).unwrap();
	let ob_ctor_img = image_method(&bump, 10, ".ctor", ctor_code, 0);
	object_base
		.initialize_methods(&bump, || {
			Ok(vec![Method::new(ob_ctor_img, object_base, ".ctor", void, &[], MethodAttributes::PUBLIC | MethodAttributes::HIDE_BY_SIG, InvokerKind::Interpreter)])
		})
		.unwrap();
	let ob_ctor = &object_base.methods()[0];
	lower_and_attach(&bump, ob_ctor, ctor_code, &[], &MapResolver::new());
	object_base.initialize_vtables(&bump, || Ok(vec![])).unwrap();

	let a_ty = types.declare_class("Demo", "A", ImageTypeKind::Class, false);
	let a = Class::new_stub(&bump, &cache, a_ty, "Demo", "A", false);
	a.initialize_super_types(|| Ok(Some(object_base))).unwrap();
	a.initialize_interfaces(&bump, || Ok(vec![])).unwrap();
	a.initialize_fields(&bump, || Ok(vec![]), None, None, 0).unwrap();
	let a_ctor_img = image_method(&bump, 11, ".ctor", ctor_code, 0);
	let a_m_code: &[u8] = &[0x17, 0x2A]; // ldc.i4.1; ret
	let a_m_img = image_method(&bump, 12, "M", a_m_code, 1);
	a.initialize_methods(&bump, || {
		Ok(vec![
			Method::new(a_ctor_img, a, ".ctor", void, &[], MethodAttributes::PUBLIC | MethodAttributes::HIDE_BY_SIG, InvokerKind::Interpreter),
			Method::new(a_m_img, a, "M", i4, &[], MethodAttributes::PUBLIC | MethodAttributes::VIRTUAL | MethodAttributes::NEW_SLOT | MethodAttributes::HIDE_BY_SIG, InvokerKind::Interpreter),
		])
	})
	.unwrap();
	let a_ctor = &a.methods()[0];
	let a_m = &a.methods()[1];
	lower_and_attach(&bump, a_ctor, ctor_code, &[], &MapResolver::new());
	lower_and_attach(&bump, a_m, a_m_code, &[], &MapResolver::new());
	a.initialize_vtables(&bump, || Ok(vec![])).unwrap();

	let b_ty = types.declare_class("Demo", "B", ImageTypeKind::Class, false);
	let b = Class::new_stub(&bump, &cache, b_ty, "Demo", "B", false);
	b.initialize_super_types(|| Ok(Some(a))).unwrap();
	b.initialize_interfaces(&bump, || Ok(vec![])).unwrap();
	b.initialize_fields(&bump, || Ok(vec![]), None, None, 0).unwrap();
	let b_ctor_img = image_method(&bump, 13, ".ctor", ctor_code, 0);
	let b_m_code: &[u8] = &[0x18, 0x2A]; // ldc.i4.2; ret
	let b_m_img = image_method(&bump, 14, "M", b_m_code, 1);
	b.initialize_methods(&bump, || {
		Ok(vec![
			Method::new(b_ctor_img, b, ".ctor", void, &[], MethodAttributes::PUBLIC | MethodAttributes::HIDE_BY_SIG, InvokerKind::Interpreter),
			Method::new(b_m_img, b, "M", i4, &[], MethodAttributes::PUBLIC | MethodAttributes::VIRTUAL | MethodAttributes::HIDE_BY_SIG, InvokerKind::Interpreter),
		])
	})
	.unwrap();
	let b_ctor = &b.methods()[0];
	let b_m = &b.methods()[1];
	lower_and_attach(&bump, b_ctor, ctor_code, &[], &MapResolver::new());
	lower_and_attach(&bump, b_m, b_m_code, &[], &MapResolver::new());
	b.initialize_vtables(&bump, || Ok(vec![])).unwrap();

	// driver: newobj B::.ctor(); callvirt A::M(); ret
	let driver_code: &[u8] = &[
		0x73, 1, 0, 0, 0, // newobj token=1 (B ctor)
		0x6F, 2, 0, 0, 0, // callvirt token=2 (A.M, statically resolved)
		0x2A, // ret
	];
	let driver_img = image_method(&bump, 15, "Drive", driver_code, 2);
	let driver = bump.alloc(Method::new(driver_img, object_base, "Drive", i4, &[], MethodAttributes::PUBLIC | MethodAttributes::STATIC, InvokerKind::Interpreter));
	let resolver = MapResolver::new().with(1, ResolvedToken::Method(b_ctor)).with(2, ResolvedToken::Method(a_m));
	lower_and_attach(&bump, driver, driver_code, &[], &resolver);

	let interp = Interpreter::new(&bump, config);
	let outcome = interp.invoke(driver, &[]).unwrap();
	assert_returned_i8(outcome, 2); // B's override wins, not A's declaration
}

fn lower_and_attach<'l>(bump: &'l Bump, method: &'l Method<'l>, code: &'l [u8], locals: &'l [&'l cil_engine::cache::TypeSig<'l>], resolver: &dyn TokenResolver<'l>) {
	let info = lower_method(bump, method, code, locals, true, &[], resolver).unwrap();
	method.set_interp_info(bump.alloc(info));
}

/// S3: `MetadataCache` hash-consing (spec.md §8 invariant 1/§3): the same
/// generic-instance argument list, generic-class pair, and by-ref view
/// resolve to the *same* pointer on repeated lookups.
#[test]
fn s3_generic_instantiation_interning() {
	let bump = Bump::new();
	let config = EngineConfig::default();
	let cache = MetadataCache::new(&bump, &config);
	let pool = DataPool::new();
	let types = pool.types();

	let i4 = cache.get_primitive(Primitive::I4);
	let string = cache.get_primitive(Primitive::String);

	let inst_a = cache.get_pooled_generic_inst(&[i4, string]);
	let inst_b = cache.get_pooled_generic_inst(&[i4, string]);
	assert!(std::ptr::eq(inst_a, inst_b), "identical argument lists must intern to the same GenericInst");

	let different = cache.get_pooled_generic_inst(&[string, i4]);
	assert!(!std::ptr::eq(inst_a, different), "argument order is part of the identity");

	let base_ty = types.declare_class("Demo", "Box`1", ImageTypeKind::Class, false);
	let gc_a = cache.get_pooled_generic_class(base_ty, inst_a);
	let gc_b = cache.get_pooled_generic_class(base_ty, inst_b);
	assert!(std::ptr::eq(gc_a, gc_b), "(base, inst) pairs must intern to the same GenericClass");

	let by_val_first = gc_a.by_val(&cache);
	let by_val_second = gc_a.by_val(&cache);
	assert!(std::ptr::eq(by_val_first, by_val_second), "by_val view must be cached per GenericClass");

	let by_ref = gc_a.by_ref(&cache);
	assert!(!std::ptr::eq(by_val_first, by_ref), "by-ref and by-val views stay pointer-distinct");

	let ref_a = cache.get_pooled_ref(i4);
	let ref_b = cache.get_pooled_ref(i4);
	assert!(std::ptr::eq(ref_a, ref_b), "by-ref pooling on a canonical sig is also cached");
}

/// S4: a `leave` crossing two nested `finally` handlers in one hop, on an
/// instance method writing through 3 fields. Both clauses share
/// `try_start = 0`; `finally_clauses_for_leave`'s tie-break is declaration
/// order, so the inner clause is listed first and must run before the
/// outer one (`f2` must be observed before `f3`).
#[test]
fn s4_nested_finally_runs_innermost_first() {
	let bump = Bump::new();
	let config = EngineConfig::default();
	let cache = MetadataCache::new(&bump, &config);
	let pool = DataPool::new();
	let types = pool.types();

	let i4 = cache.get_primitive(Primitive::I4);
	let void = cache.get_primitive(Primitive::Void);

	let counter_ty = types.declare_class("Demo", "Counter", ImageTypeKind::Class, false);
	let counter = Class::new_stub(&bump, &cache, counter_ty, "Demo", "Counter", false);
	counter.initialize_super_types(|| Ok(None)).unwrap();
	counter.initialize_interfaces(&bump, || Ok(vec![])).unwrap();
	counter
		.initialize_fields(&bump, || {
			Ok(vec![
				Field { owner: counter, name: "f1", sig: i4, flags: FieldAttributes::PUBLIC, offset: None },
				Field { owner: counter, name: "f2", sig: i4, flags: FieldAttributes::PUBLIC, offset: None },
				Field { owner: counter, name: "f3", sig: i4, flags: FieldAttributes::PUBLIC, offset: None },
			])
		}, None, None, 0)
		.unwrap();

	// ldarg.0; ldc.i4.1; stfld f1;
	// .try { leave.s END }
	//   .finally (inner) { ldarg.0; ldc.i4.2; stfld f2; endfinally }
	// .finally (outer) { ldarg.0; ldc.i4.3; stfld f3; endfinally }
	// END: ret
	#[rustfmt::skip]
	let code: &[u8] = &[
		0x02,                   // 0:  ldarg.0
		0x17,                   // 1:  ldc.i4.1
		0x7D, 1, 0, 0, 0,       // 2:  stfld f1 (token=1)
		0xDE, 0x10,             // 7:  leave.s +16 -> 25 (END)
		0x02,                   // 9:  ldarg.0         -- inner finally handler
		0x18,                   // 10: ldc.i4.2
		0x7D, 2, 0, 0, 0,       // 11: stfld f2 (token=2)
		0xDC,                   // 16: endfinally
		0x02,                   // 17: ldarg.0         -- outer finally handler
		0x19,                   // 18: ldc.i4.3
		0x7D, 3, 0, 0, 0,       // 19: stfld f3 (token=3)
		0xDC,                   // 24: endfinally
		0x2A,                   // 25: ret             -- END
	];

	let image_md = image_method(&bump, 2, "RunTry", code, 2);
	counter
		.initialize_methods(&bump, || {
			Ok(vec![Method::new(image_md, counter, "RunTry", void, &[], MethodAttributes::PUBLIC | MethodAttributes::HIDE_BY_SIG, InvokerKind::Interpreter)])
		})
		.unwrap();
	let method = &counter.methods()[0];
	counter.initialize_vtables(&bump, || Ok(vec![])).unwrap();

	let resolver = MapResolver::new().with(1, ResolvedToken::Field(counter, 0)).with(2, ResolvedToken::Field(counter, 1)).with(3, ResolvedToken::Field(counter, 2));
	let clauses = [
		RawClause { kind: ExceptionClauseKind::Finally, try_start: 0, try_end: 9, handler_start: 9, handler_end: 17, filter_start: None, catch_class: None },
		RawClause { kind: ExceptionClauseKind::Finally, try_start: 0, try_end: 17, handler_start: 17, handler_end: 25, filter_start: None, catch_class: None },
	];
	let info = lower_method(&bump, method, code, &[], true, &clauses, &resolver).unwrap();
	method.set_interp_info(bump.alloc(info));

	let obj: &mut [u8] = object::new_object(&bump, counter);
	let obj_ref: object::ObjectRef = &*obj;

	let interp = Interpreter::new(&bump, config);
	let outcome = interp.invoke(method, &[Value::Ref(Some(obj_ref))]).unwrap();
	assert_returned_none(outcome);

	let body = object::object_body(obj_ref);
	assert_eq!(i32::from_ne_bytes(body[0..4].try_into().unwrap()), 1, "f1");
	assert_eq!(i32::from_ne_bytes(body[4..8].try_into().unwrap()), 2, "f2 (inner finally)");
	assert_eq!(i32::from_ne_bytes(body[8..12].try_into().unwrap()), 3, "f3 (outer finally)");
}

/// S5: `constrained.callvirt` on an enum's `GetHashCode`, exercising
/// `do_constrained_call`'s fast path that reads the boxed int straight out
/// of the unboxed value's stack slot instead of dispatching a real call.
#[test]
fn s5_constrained_callvirt_enum_get_hash_code() {
	let bump = Bump::new();
	let config = EngineConfig::default();
	let cache = MetadataCache::new(&bump, &config);
	let pool = DataPool::new();
	let types = pool.types();

	let i4 = cache.get_primitive(Primitive::I4);

	let enum_base_ty = types.declare_class("System", "Enum", ImageTypeKind::Class, false);
	let enum_base = Class::new_stub(&bump, &cache, enum_base_ty, "System", "Enum", false);
	enum_base.initialize_super_types(|| Ok(None)).unwrap();

	let color_ty = types.declare_class("Demo", "Color", ImageTypeKind::Class, true);
	let color = Class::new_stub(&bump, &cache, color_ty, "Demo", "Color", true);
	color.initialize_super_types(|| Ok(Some(enum_base))).unwrap();
	assert!(matches!(color.family(), cil_engine::class::Family::Enum));
	color.initialize_interfaces(&bump, || Ok(vec![])).unwrap();
	color.initialize_fields(&bump, || Ok(vec![]), None, Some(4), 0).unwrap();

	// A virtual GetHashCode declared somewhere in the hierarchy; the fast
	// path only inspects its name/arity, never actually invokes it.
	let root_ty = types.declare_class("System", "Object", ImageTypeKind::Class, false);
	let root = Class::new_stub(&bump, &cache, root_ty, "System", "Object", false);
	root.initialize_super_types(|| Ok(None)).unwrap();
	let decl_img = image_method(&bump, 20, "GetHashCode", &[0x2A], 0);
	let decl = bump.alloc(Method::new(decl_img, root, "GetHashCode", i4, &[], MethodAttributes::PUBLIC | MethodAttributes::VIRTUAL | MethodAttributes::HIDE_BY_SIG, InvokerKind::Interpreter));

	// locals[0]: Color, loaded inline as a raw i32 bit pattern (no
	// ldloca/box step — value types ride in one full stack slot here).
	// ldc.i4.7; stloc.0; ldloc.0; constrained. Color; callvirt GetHashCode(); ret
	#[rustfmt::skip]
	let code: &[u8] = &[
		0x1D,                         // 0: ldc.i4.7
		0x0A,                         // 1: stloc.0
		0x06,                         // 2: ldloc.0
		0xFE, 0x16, 10, 0, 0, 0,      // 3: constrained. token=10 (Color)
		0x6F, 11, 0, 0, 0,            // 9: callvirt token=11 (GetHashCode)
		0x2A,                         // 14: ret
	];

	let driver_img = image_method(&bump, 21, "Hash", code, 2);
	let driver = bump.alloc(Method::new(driver_img, root, "Hash", i4, &[], MethodAttributes::PUBLIC | MethodAttributes::STATIC, InvokerKind::Interpreter));
	let resolver = MapResolver::new().with(10, ResolvedToken::Class(color)).with(11, ResolvedToken::Method(decl));
	let locals = bump.alloc_slice_copy(&[color.by_val]);
	let info = lower_method(&bump, driver, code, locals, true, &[], &resolver).unwrap();
	driver.set_interp_info(bump.alloc(info));

	let interp = Interpreter::new(&bump, config);
	let outcome = interp.invoke(driver, &[]).unwrap();
	assert_returned_i8(outcome, 7);
}

/// S6: the array store check (`stelem`) reads the array's *actual* element
/// class off its header, not the static token the instruction carries.
/// Storing a same-class reference succeeds; storing a boxed value type
/// through a reference-typed element slot is rejected.
#[test]
fn s6_array_covariance_store_check() {
	let bump = Bump::new();
	let config = EngineConfig::default();
	let cache = MetadataCache::new(&bump, &config);
	let pool = DataPool::new();
	let types = pool.types();

	let object_sig = cache.get_primitive(Primitive::Object);

	let array_root_ty = types.declare_class("System", "Array", ImageTypeKind::Class, false);
	let array_root = Class::new_stub(&bump, &cache, array_root_ty, "System", "Array", false);
	array_root.initialize_super_types(|| Ok(None)).unwrap();

	let string_ty = types.declare_class("System", "String", ImageTypeKind::Class, false);
	let string_class = Class::new_stub(&bump, &cache, string_ty, "System", "String", false);
	string_class.initialize_super_types(|| Ok(None)).unwrap();

	let int32_ty = types.declare_class("System", "Int32", ImageTypeKind::Primitive, true);
	let int32_class = Class::new_stub(&bump, &cache, int32_ty, "System", "Int32", true);
	int32_class.initialize_super_types(|| Ok(None)).unwrap();
	int32_class.initialize_fields(&bump, || Ok(vec![]), None, Some(4), 0).unwrap();

	let array_ty = types.declare_class("Demo", "StringArray", ImageTypeKind::Array, false);
	let array_class = Class::new_stub_with_array_shape(&bump, &cache, array_ty, "Demo", "StringArray", false, Some(string_class), 1);
	array_class.initialize_super_types(|| Ok(Some(array_root))).unwrap();

	// ldarg.0 (array); ldc.i4.0; ldarg.1 (value); stelem token=1 (String); ret
	let code: &[u8] = &[0x02, 0x16, 0x03, 0xA4, 1, 0, 0, 0, 0x2A];
	let image_md = image_method(&bump, 30, "Store", code, 3);
	let method = bump.alloc(Method::new(
		image_md,
		array_root,
		"Store",
		cache.get_primitive(Primitive::Void),
		bump.alloc_slice_copy(&[array_class.by_val, object_sig]),
		MethodAttributes::PUBLIC | MethodAttributes::STATIC,
		InvokerKind::Interpreter,
	));
	let resolver = MapResolver::new().with(1, ResolvedToken::Class(string_class));
	let info = lower_method(&bump, method, code, &[], true, &[], &resolver).unwrap();
	method.set_interp_info(bump.alloc(info));

	let array = object::new_sz_array(&bump, array_class, 3, std::mem::size_of::<usize>());
	let array_ref: object::ObjectRef = &*array;

	let interp = Interpreter::new(&bump, config);

	let same_class_value = object::new_object(&bump, string_class);
	let value_ref: object::ObjectRef = &*same_class_value;
	let outcome = interp.invoke(method, &[Value::Ref(Some(array_ref)), Value::Ref(Some(value_ref))]).unwrap();
	assert_returned_none(outcome);

	let boxed_int = object::box_value(&bump, int32_class, &7i32.to_ne_bytes()).unwrap();
	let boxed_ref: object::ObjectRef = &*boxed_int;
	let err = interp.invoke(method, &[Value::Ref(Some(array_ref)), Value::Ref(Some(boxed_ref))]).unwrap_err();
	assert_eq!(err, RtErr::ArrayTypeMismatch);
}

/// S7: a `MethodImpl` row re-points `Base::M`'s vtable slot to a
/// differently-named method on `Derived` (the explicit-interface-style
/// override `build_vtable`'s ordinary name/signature search would never
/// match), exercising spec.md §4.3 step 3 end to end.
#[test]
fn s7_method_impl_overrides_vtable_slot() {
	let bump = Bump::new();
	let config = EngineConfig::default();
	let cache = MetadataCache::new(&bump, &config);
	let pool = DataPool::new();
	let types = pool.types();

	let i4 = cache.get_primitive(Primitive::I4);
	let void = cache.get_primitive(Primitive::Void);

	let base_ty = types.declare_class("Demo", "Base", ImageTypeKind::Class, false);
	let base = Class::new_stub(&bump, &cache, base_ty, "Demo", "Base", false);
	base.initialize_super_types(|| Ok(None)).unwrap();
	base.initialize_interfaces(&bump, || Ok(vec![])).unwrap();
	base.initialize_fields(&bump, || Ok(vec![]), None, None, 0).unwrap();
	let base_ctor_code: &[u8] = &[0x2A];
	let base_ctor_img = image_method(&bump, 50, ".ctor", base_ctor_code, 0);
	let base_m_code: &[u8] = &[0x17, 0x2A]; // ldc.i4.1; ret
	let base_m_img = image_method(&bump, 51, "M", base_m_code, 1);
	base.initialize_methods(&bump, || {
		Ok(vec![
			Method::new(base_ctor_img, base, ".ctor", void, &[], MethodAttributes::PUBLIC | MethodAttributes::HIDE_BY_SIG, InvokerKind::Interpreter),
			Method::new(base_m_img, base, "M", i4, &[], MethodAttributes::PUBLIC | MethodAttributes::VIRTUAL | MethodAttributes::NEW_SLOT | MethodAttributes::HIDE_BY_SIG, InvokerKind::Interpreter),
		])
	})
	.unwrap();
	let base_ctor = &base.methods()[0];
	let base_m = &base.methods()[1];
	lower_and_attach(&bump, base_ctor, base_ctor_code, &[], &MapResolver::new());
	lower_and_attach(&bump, base_m, base_m_code, &[], &MapResolver::new());
	base.initialize_vtables(&bump, || Ok(vec![])).unwrap();

	let derived_ty = types.declare_class("Demo", "Derived", ImageTypeKind::Class, false);
	let derived = Class::new_stub(&bump, &cache, derived_ty, "Demo", "Derived", false);
	derived.initialize_super_types(|| Ok(Some(base))).unwrap();
	derived.initialize_interfaces(&bump, || Ok(vec![])).unwrap();
	derived.initialize_fields(&bump, || Ok(vec![]), None, None, 0).unwrap();
	let derived_ctor_code: &[u8] = &[0x2A];
	let derived_ctor_img = image_method(&bump, 52, ".ctor", derived_ctor_code, 0);
	// Named differently from "M" on purpose: only the MethodImpl row below,
	// not the ordinary override search, connects this to Base::M's slot.
	let explicit_code: &[u8] = &[0x18, 0x2A]; // ldc.i4.2; ret
	let explicit_img = image_method(&bump, 53, "Demo.Base.M", explicit_code, 1);
	derived
		.initialize_methods(&bump, || {
			Ok(vec![
				Method::new(derived_ctor_img, derived, ".ctor", void, &[], MethodAttributes::PUBLIC | MethodAttributes::HIDE_BY_SIG, InvokerKind::Interpreter),
				Method::new(
					explicit_img,
					derived,
					"Demo.Base.M",
					i4,
					&[],
					MethodAttributes::PRIVATE | MethodAttributes::VIRTUAL | MethodAttributes::NEW_SLOT | MethodAttributes::HIDE_BY_SIG,
					InvokerKind::Interpreter,
				),
			])
		})
		.unwrap();
	let derived_ctor = &derived.methods()[0];
	let explicit_m = &derived.methods()[1];
	lower_and_attach(&bump, derived_ctor, derived_ctor_code, &[], &MapResolver::new());
	lower_and_attach(&bump, explicit_m, explicit_code, &[], &MapResolver::new());
	derived.initialize_vtables(&bump, || Ok(vec![MethodImpl { declaration: base_m, body: explicit_m }])).unwrap();

	// driver: newobj Derived::.ctor(); callvirt Base::M(); ret
	let driver_code: &[u8] = &[
		0x73, 1, 0, 0, 0, // newobj token=1 (Derived ctor)
		0x6F, 2, 0, 0, 0, // callvirt token=2 (Base.M, statically resolved)
		0x2A,
	];
	let driver_img = image_method(&bump, 54, "Drive", driver_code, 2);
	let driver = bump.alloc(Method::new(driver_img, base, "Drive", i4, &[], MethodAttributes::PUBLIC | MethodAttributes::STATIC, InvokerKind::Interpreter));
	let resolver = MapResolver::new().with(1, ResolvedToken::Method(derived_ctor)).with(2, ResolvedToken::Method(base_m));
	lower_and_attach(&bump, driver, driver_code, &[], &resolver);

	let interp = Interpreter::new(&bump, config);
	let outcome = interp.invoke(driver, &[]).unwrap();
	assert_returned_i8(outcome, 2); // MethodImpl's body wins, not Base's own M
}
