//! Builds synthetic `Class`/`Method` graphs in memory and drives the S1-S6
//! scenarios (spec.md §8) through `cil_engine::il::lower_method` and
//! `cil_engine::interp::Interpreter`, without an assembly fixture anywhere
//! in the loop. Generalizes the teacher's `cilium` binary's "load an image
//! and poke at one table" idiom to "construct metadata and poke at the
//! interpreter" - see `engine/tests/scenarios.rs` for the same graphs built
//! as asserted tests rather than printed demos.

use std::collections::HashMap;

use bumpalo::Bump;
use cil_image::raw::heaps::table::{FieldAttributes, MethodAttributes};
use cil_image::raw::indices::metadata_token::{MethodDefToken, StringToken};
use cil_image::schema::r#type::TypeKind as ImageTypeKind;
use cil_image::schema::{DataPool, InternedString, Method as ImageMethod, MethodBody};

use cil_engine::cache::{MetadataCache, Primitive};
use cil_engine::class::{Class, Field, InvokerKind, Method};
use cil_engine::config::EngineConfig;
use cil_engine::error::{RtErr, RtResult};
use cil_engine::il::{lower_method, ExceptionClauseKind, RawClause, ResolvedToken, TokenResolver};
use cil_engine::interp::{ExecOutcome, Interpreter, Value};
use cil_engine::object;

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

fn image_method<'l>(bump: &'l Bump, token: usize, name: &'static str, code: &'l [u8], max_stack: u16) -> &'l ImageMethod<'l> {
	let body = MethodBody { max_stack_size: max_stack, init_locals: true, code, locals: &[] };
	bump.alloc(ImageMethod::new(MethodDefToken(token), InternedString::new(name, StringToken(token).into()), Some(body)))
}

fn lower_and_attach<'l>(bump: &'l Bump, method: &'l Method<'l>, code: &'l [u8], locals: &'l [&'l cil_engine::cache::TypeSig<'l>], resolver: &dyn TokenResolver<'l>) -> RtResult<()> {
	let info = lower_method(bump, method, code, locals, true, &[], resolver)?;
	method.set_interp_info(bump.alloc(info));
	Ok(())
}

fn i8_of(v: Option<Value>) -> RtResult<i64> {
	match v {
		Some(Value::I8(n)) => Ok(n),
		_ => Err(RtErr::ExecutionEngine),
	}
}

/// S1: an iterative loop computing the 10th Fibonacci number.
fn demo_fibonacci_loop() -> RtResult<i64> {
	let bump = Bump::new();
	let config = EngineConfig::default();
	let cache = MetadataCache::new(&bump, &config);
	let pool = DataPool::new();
	let types = pool.types();

	let i4 = cache.get_primitive(Primitive::I4);

	let owner_ty = types.declare_class("Demo", "Fib", ImageTypeKind::Class, false);
	let owner = Class::new_stub(&bump, &cache, owner_ty, "Demo", "Fib", false);
	owner.initialize_super_types(|| Ok(None))?;
	owner.initialize_interfaces(&bump, || Ok(vec![]))?;
	owner.initialize_fields(&bump, || Ok(vec![]), None, None, 0)?;

	#[rustfmt::skip]
	let code: &[u8] = &[
		0x16, 0x0A, 0x17, 0x0B, 0x16, 0x0C,
		0x08, 0x1F, 0x0A, 0x2F, 0x0E,
		0x06, 0x07, 0x58, 0x0D, 0x07, 0x0A, 0x09, 0x0B, 0x08, 0x17, 0x58, 0x0C,
		0x2B, 0xED,
		0x06, 0x2A,
	];

	let image_md = image_method(&bump, 1, "Compute", code, 4);
	let method = bump.alloc(Method::new(image_md, owner, "Compute", i4, &[], MethodAttributes::PUBLIC | MethodAttributes::STATIC, InvokerKind::Interpreter));
	let resolver = MapResolver::new();
	let locals = bump.alloc_slice_copy(&[i4, i4, i4, i4]);
	lower_and_attach(&bump, method, code, locals, &resolver)?;

	let interp = Interpreter::new(&bump, config);
	match interp.invoke(method, &[])? {
		ExecOutcome::Returned(v) => i8_of(v),
		ExecOutcome::Threw(_) => Err(RtErr::ExecutionEngine),
	}
}

/// S2: a three-class hierarchy where `B::M` overrides `A::M`; a driver
/// constructs a `B` and calls through `A::M`'s declaration via `callvirt`.
fn demo_virtual_dispatch() -> RtResult<i64> {
	let bump = Bump::new();
	let config = EngineConfig::default();
	let cache = MetadataCache::new(&bump, &config);
	let pool = DataPool::new();
	let types = pool.types();

	let i4 = cache.get_primitive(Primitive::I4);
	let void = cache.get_primitive(Primitive::Void);
	let ctor_code: &[u8] = &[0x2A];

	let object_base_ty = types.declare_class("Demo", "ObjectBase", ImageTypeKind::Class, false);
	let object_base = Class::new_stub(&bump, &cache, object_base_ty, "Demo", "ObjectBase", false);
	object_base.initialize_super_types(|| Ok(None))?;
	object_base.initialize_interfaces(&bump, || Ok(vec![]))?;
	object_base.initialize_fields(&bump, || Ok(vec![]), None, None, 0)?;
	let ob_ctor_img = image_method(&bump, 10, ".ctor", ctor_code, 0);
	object_base.initialize_methods(&bump, || Ok(vec![Method::new(ob_ctor_img, object_base, ".ctor", void, &[], MethodAttributes::PUBLIC | MethodAttributes::HIDE_BY_SIG, InvokerKind::Interpreter)]))?;
	lower_and_attach(&bump, &object_base.methods()[0], ctor_code, &[], &MapResolver::new())?;
	object_base.initialize_vtables(&bump, || Ok(vec![]))?;

	let a_ty = types.declare_class("Demo", "A", ImageTypeKind::Class, false);
	let a = Class::new_stub(&bump, &cache, a_ty, "Demo", "A", false);
	a.initialize_super_types(|| Ok(Some(object_base)))?;
	a.initialize_interfaces(&bump, || Ok(vec![]))?;
	a.initialize_fields(&bump, || Ok(vec![]), None, None, 0)?;
	let a_ctor_img = image_method(&bump, 11, ".ctor", ctor_code, 0);
	let a_m_code: &[u8] = &[0x17, 0x2A];
	let a_m_img = image_method(&bump, 12, "M", a_m_code, 1);
	a.initialize_methods(&bump, || {
		Ok(vec![
			Method::new(a_ctor_img, a, ".ctor", void, &[], MethodAttributes::PUBLIC | MethodAttributes::HIDE_BY_SIG, InvokerKind::Interpreter),
			Method::new(a_m_img, a, "M", i4, &[], MethodAttributes::PUBLIC | MethodAttributes::VIRTUAL | MethodAttributes::NEW_SLOT | MethodAttributes::HIDE_BY_SIG, InvokerKind::Interpreter),
		])
	})?;
	lower_and_attach(&bump, &a.methods()[0], ctor_code, &[], &MapResolver::new())?;
	lower_and_attach(&bump, &a.methods()[1], a_m_code, &[], &MapResolver::new())?;
	a.initialize_vtables(&bump, || Ok(vec![]))?;
	let a_m = &a.methods()[1];

	let b_ty = types.declare_class("Demo", "B", ImageTypeKind::Class, false);
	let b = Class::new_stub(&bump, &cache, b_ty, "Demo", "B", false);
	b.initialize_super_types(|| Ok(Some(a)))?;
	b.initialize_interfaces(&bump, || Ok(vec![]))?;
	b.initialize_fields(&bump, || Ok(vec![]), None, None, 0)?;
	let b_ctor_img = image_method(&bump, 13, ".ctor", ctor_code, 0);
	let b_m_code: &[u8] = &[0x18, 0x2A];
	let b_m_img = image_method(&bump, 14, "M", b_m_code, 1);
	b.initialize_methods(&bump, || {
		Ok(vec![
			Method::new(b_ctor_img, b, ".ctor", void, &[], MethodAttributes::PUBLIC | MethodAttributes::HIDE_BY_SIG, InvokerKind::Interpreter),
			Method::new(b_m_img, b, "M", i4, &[], MethodAttributes::PUBLIC | MethodAttributes::VIRTUAL | MethodAttributes::HIDE_BY_SIG, InvokerKind::Interpreter),
		])
	})?;
	lower_and_attach(&bump, &b.methods()[0], ctor_code, &[], &MapResolver::new())?;
	lower_and_attach(&bump, &b.methods()[1], b_m_code, &[], &MapResolver::new())?;
	b.initialize_vtables(&bump, || Ok(vec![]))?;
	let b_ctor = &b.methods()[0];

	let driver_code: &[u8] = &[0x73, 1, 0, 0, 0, 0x6F, 2, 0, 0, 0, 0x2A];
	let driver_img = image_method(&bump, 15, "Drive", driver_code, 2);
	let driver = bump.alloc(Method::new(driver_img, object_base, "Drive", i4, &[], MethodAttributes::PUBLIC | MethodAttributes::STATIC, InvokerKind::Interpreter));
	let resolver = MapResolver::new().with(1, ResolvedToken::Method(b_ctor)).with(2, ResolvedToken::Method(a_m));
	lower_and_attach(&bump, driver, driver_code, &[], &resolver)?;

	let interp = Interpreter::new(&bump, config);
	match interp.invoke(driver, &[])? {
		ExecOutcome::Returned(v) => i8_of(v),
		ExecOutcome::Threw(_) => Err(RtErr::ExecutionEngine),
	}
}

/// S4: a `leave` crossing two nested `finally` handlers sharing the same
/// `try_start`; the inner handler must observe its write before the outer.
fn demo_nested_finally() -> RtResult<(i32, i32, i32)> {
	let bump = Bump::new();
	let config = EngineConfig::default();
	let cache = MetadataCache::new(&bump, &config);
	let pool = DataPool::new();
	let types = pool.types();

	let i4 = cache.get_primitive(Primitive::I4);
	let void = cache.get_primitive(Primitive::Void);

	let counter_ty = types.declare_class("Demo", "Counter", ImageTypeKind::Class, false);
	let counter = Class::new_stub(&bump, &cache, counter_ty, "Demo", "Counter", false);
	counter.initialize_super_types(|| Ok(None))?;
	counter.initialize_interfaces(&bump, || Ok(vec![]))?;
	counter.initialize_fields(
		&bump,
		|| {
			Ok(vec![
				Field { owner: counter, name: "f1", sig: i4, flags: FieldAttributes::PUBLIC, offset: None },
				Field { owner: counter, name: "f2", sig: i4, flags: FieldAttributes::PUBLIC, offset: None },
				Field { owner: counter, name: "f3", sig: i4, flags: FieldAttributes::PUBLIC, offset: None },
			])
		},
		None,
		None,
		0,
	)?;

	#[rustfmt::skip]
	let code: &[u8] = &[
		0x02, 0x17, 0x7D, 1, 0, 0, 0,
		0xDE, 0x10,
		0x02, 0x18, 0x7D, 2, 0, 0, 0, 0xDC,
		0x02, 0x19, 0x7D, 3, 0, 0, 0, 0xDC,
		0x2A,
	];

	let image_md = image_method(&bump, 2, "RunTry", code, 2);
	counter.initialize_methods(&bump, || Ok(vec![Method::new(image_md, counter, "RunTry", void, &[], MethodAttributes::PUBLIC | MethodAttributes::HIDE_BY_SIG, InvokerKind::Interpreter)]))?;
	let method = &counter.methods()[0];
	counter.initialize_vtables(&bump, || Ok(vec![]))?;

	let resolver = MapResolver::new().with(1, ResolvedToken::Field(counter, 0)).with(2, ResolvedToken::Field(counter, 1)).with(3, ResolvedToken::Field(counter, 2));
	let clauses = [
		RawClause { kind: ExceptionClauseKind::Finally, try_start: 0, try_end: 9, handler_start: 9, handler_end: 17, filter_start: None, catch_class: None },
		RawClause { kind: ExceptionClauseKind::Finally, try_start: 0, try_end: 17, handler_start: 17, handler_end: 25, filter_start: None, catch_class: None },
	];
	let info = lower_method(&bump, method, code, &[], true, &clauses, &resolver)?;
	method.set_interp_info(bump.alloc(info));

	let obj: &mut [u8] = object::new_object(&bump, counter);
	let obj_ref: object::ObjectRef = &*obj;

	let interp = Interpreter::new(&bump, config);
	interp.invoke(method, &[Value::Ref(Some(obj_ref))])?;

	let body = object::object_body(obj_ref);
	let f1 = i32::from_ne_bytes(body[0..4].try_into().unwrap());
	let f2 = i32::from_ne_bytes(body[4..8].try_into().unwrap());
	let f3 = i32::from_ne_bytes(body[8..12].try_into().unwrap());
	Ok((f1, f2, f3))
}

/// S6: `stelem`'s store check reads the array's actual element class off
/// its header. A same-class store succeeds; a boxed value type through a
/// reference-typed element slot is rejected.
fn demo_array_store_check() -> RtResult<()> {
	let bump = Bump::new();
	let config = EngineConfig::default();
	let cache = MetadataCache::new(&bump, &config);
	let pool = DataPool::new();
	let types = pool.types();

	let object_sig = cache.get_primitive(Primitive::Object);

	let array_root_ty = types.declare_class("System", "Array", ImageTypeKind::Class, false);
	let array_root = Class::new_stub(&bump, &cache, array_root_ty, "System", "Array", false);
	array_root.initialize_super_types(|| Ok(None))?;

	let string_ty = types.declare_class("System", "String", ImageTypeKind::Class, false);
	let string_class = Class::new_stub(&bump, &cache, string_ty, "System", "String", false);
	string_class.initialize_super_types(|| Ok(None))?;

	let int32_ty = types.declare_class("System", "Int32", ImageTypeKind::Primitive, true);
	let int32_class = Class::new_stub(&bump, &cache, int32_ty, "System", "Int32", true);
	int32_class.initialize_super_types(|| Ok(None))?;
	int32_class.initialize_fields(&bump, || Ok(vec![]), None, Some(4), 0)?;

	let array_ty = types.declare_class("Demo", "StringArray", ImageTypeKind::Array, false);
	let array_class = Class::new_stub_with_array_shape(&bump, &cache, array_ty, "Demo", "StringArray", false, Some(string_class), 1);
	array_class.initialize_super_types(|| Ok(Some(array_root)))?;

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
	let info = lower_method(&bump, method, code, &[], true, &[], &resolver)?;
	method.set_interp_info(bump.alloc(info));

	let array = object::new_sz_array(&bump, array_class, 3, std::mem::size_of::<usize>());
	let array_ref: object::ObjectRef = &*array;
	let interp = Interpreter::new(&bump, config);

	let same_class_value = object::new_object(&bump, string_class);
	let value_ref: object::ObjectRef = &*same_class_value;
	interp.invoke(method, &[Value::Ref(Some(array_ref)), Value::Ref(Some(value_ref))])?;

	let boxed_int = object::box_value(&bump, int32_class, &7i32.to_ne_bytes())?;
	let boxed_ref: object::ObjectRef = &*boxed_int;
	match interp.invoke(method, &[Value::Ref(Some(array_ref)), Value::Ref(Some(boxed_ref))]) {
		Err(RtErr::ArrayTypeMismatch) => Ok(()),
		Err(other) => Err(other),
		Ok(_) => Err(RtErr::ExecutionEngine),
	}
}

fn run<T>(name: &str, demo: impl FnOnce() -> RtResult<T>) -> bool
where
	T: std::fmt::Debug,
{
	match demo() {
		Ok(v) => {
			println!("[ok]   {name}: {v:?}");
			true
		}
		Err(e) => {
			println!("[FAIL] {name}: {e:?}");
			false
		}
	}
}

fn main() {
	tracing_subscriber::fmt::init();

	println!("cil-engine-demos: synthetic metadata graphs driving the interpreter directly");

	let mut all_ok = true;
	all_ok &= run("s1_iterative_fibonacci_loop", demo_fibonacci_loop);
	all_ok &= run("s2_virtual_dispatch_picks_the_override", demo_virtual_dispatch);
	all_ok &= run("s4_nested_finally_runs_innermost_first", demo_nested_finally);
	all_ok &= run("s6_array_covariance_store_check", demo_array_store_check);

	if !all_ok {
		std::process::exit(1);
	}
}
