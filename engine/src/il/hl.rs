//! Pass 1 (C7): decodes a method's raw CIL bytes into block-structured,
//! typed high-level IR with an abstract evaluation stack, grounded in
//! `original_source/.../interp/hl_transformer.cpp`'s `Transformer` (basic
//! blocks, `Variable`, `add_br`/`add_condition_branch`,
//! `add_brtrue_or_false`).
//!
//! Scope note (see DESIGN.md): metadata-token → member resolution (walking
//! MemberRef/TypeSpec/MethodSpec) is the image reader's concern, out of
//! this crate's scope per spec.md §1; callers supply a `TokenResolver`
//! that has already done this. Likewise, full cross-block evaluation-stack
//! join validation (spec.md §8 invariant 5) is not implemented — blocks
//! are assumed single-entry in source order, the shape ordinary compilers
//! emit and the shape `demos` builds for every scenario body.

use crate::class::{Class, Method};
use crate::error::{RtErr, RtResult};
use crate::il::{ExceptionClauseKind, RawClause};

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum StackKind {
	I4,
	I8,
	R4,
	R8,
	RefOrPtr,
	Other { byte_size: u32 },
}

impl StackKind {
	/// `ceil(size / pointer-size)`, capped at 1 (glossary: "Stack object").
	pub fn stack_object_size(&self, ptr_size: u32) -> u32 {
		let byte_size = match self {
			StackKind::I4 | StackKind::R4 => 4,
			StackKind::I8 | StackKind::R8 => 8,
			StackKind::RefOrPtr => ptr_size,
			StackKind::Other { byte_size } => *byte_size,
		};
		byte_size.div_ceil(ptr_size).max(1)
	}
}

#[derive(Debug, Copy, Clone)]
pub struct Variable {
	pub id: u32,
	pub kind: StackKind,
	/// Offset into the frame's stack-object storage (args, then locals,
	/// then evaluation-stack slots, in that order).
	pub offset: u32,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum CompareOp {
	Eq,
	Gt,
	Lt,
	Ge,
	Le,
	Ne,
}

/// One resolved operand a token-bearing opcode may carry. Produced by the
/// caller's [`TokenResolver`]; see the module scope note.
#[derive(Debug, Copy, Clone)]
pub enum ResolvedToken<'l> {
	Method(&'l Method<'l>),
	Field(&'l Class<'l>, usize),
	Class(&'l Class<'l>),
	StringLiteral(&'l str),
}

pub trait TokenResolver<'l> {
	fn resolve(&self, token: u32) -> RtResult<ResolvedToken<'l>>;
}

#[derive(Debug, Copy, Clone)]
pub enum HlOp<'l> {
	Nop,
	LdcI4(i32, Variable),
	LdArg(u16, Variable),
	StArg(u16, Variable),
	LdLoc(u16, Variable),
	StLoc(u16, Variable),
	Dup(Variable, Variable),
	Pop(Variable),
	Add(Variable, Variable, Variable),
	Sub(Variable, Variable, Variable),
	Mul(Variable, Variable, Variable),
	Div { un: bool, a: Variable, b: Variable, dst: Variable },
	Rem { un: bool, a: Variable, b: Variable, dst: Variable },
	Compare { op: CompareOp, un: bool, a: Variable, b: Variable, dst: Variable },
	Br(u32),
	BrCond { branch_if_true: bool, cond: Variable, target: u32 },
	BrCompare { op: CompareOp, un: bool, a: Variable, b: Variable, target: u32 },
	Ret(Option<Variable>),
	Call { method: &'l Method<'l>, constrained: Option<&'l Class<'l>>, args: &'l [Variable], ret: Option<Variable>, is_virtual: bool },
	NewObj { ctor: &'l Method<'l>, args: &'l [Variable], dst: Variable },
	LdFld { owner: &'l Class<'l>, index: usize, obj: Variable, dst: Variable },
	StFld { owner: &'l Class<'l>, index: usize, obj: Variable, src: Variable },
	LdSFld { owner: &'l Class<'l>, index: usize, dst: Variable },
	StSFld { owner: &'l Class<'l>, index: usize, src: Variable },
	NewArr { elem: &'l Class<'l>, len: Variable, dst: Variable },
	LdElem { elem: &'l Class<'l>, array: Variable, index: Variable, dst: Variable },
	StElem { elem: &'l Class<'l>, array: Variable, index: Variable, src: Variable },
	Box { class: &'l Class<'l>, src: Variable, dst: Variable },
	UnboxAny { class: &'l Class<'l>, src: Variable, dst: Variable },
	Throw(Variable),
	Rethrow,
	Leave(u32),
	EndFinally,
}

/// One decoded instruction, tagged with the IL offset it started at (IR
/// offset assignment happens in C8).
#[derive(Debug, Copy, Clone)]
pub struct HlInst<'l> {
	pub il_offset: u32,
	pub op: HlOp<'l>,
}

#[derive(Debug)]
pub struct BasicBlock<'l> {
	pub start_il_offset: u32,
	pub end_il_offset: u32,
	pub instrs: Vec<HlInst<'l>>,
	pub entry_stack: Vec<StackKind>,
}

#[derive(Debug)]
pub struct HlMethod<'l> {
	pub blocks: Vec<BasicBlock<'l>>,
	pub clauses: Vec<RawClause<'l>>,
	pub max_stack_objects: u32,
	pub arg_and_local_stack_objects: u32,
	pub ret: Option<StackKind>,
	/// Argument/local storage slots in frame-offset order, carried through
	/// so C8 can recover a `ldarg`/`ldloc`'s source offset from the index
	/// its `HlOp` stores (the op itself only keeps the destination
	/// `Variable`, assigned fresh on every push).
	pub arg_vars: Vec<Variable>,
	pub local_vars: Vec<Variable>,
}

const PTR_SIZE: u32 = std::mem::size_of::<usize>() as u32;

struct Decoder<'a> {
	code: &'a [u8],
	pos: usize,
}

impl<'a> Decoder<'a> {
	fn u8(&mut self) -> RtResult<u8> {
		let b = *self.code.get(self.pos).ok_or(RtErr::BadImageFormat)?;
		self.pos += 1;
		Ok(b)
	}

	fn i8(&mut self) -> RtResult<i8> {
		Ok(self.u8()? as i8)
	}

	fn u16(&mut self) -> RtResult<u16> {
		let bytes = self.code.get(self.pos..self.pos + 2).ok_or(RtErr::BadImageFormat)?;
		self.pos += 2;
		Ok(u16::from_le_bytes(bytes.try_into().unwrap()))
	}

	fn i32(&mut self) -> RtResult<i32> {
		let bytes = self.code.get(self.pos..self.pos + 4).ok_or(RtErr::BadImageFormat)?;
		self.pos += 4;
		Ok(i32::from_le_bytes(bytes.try_into().unwrap()))
	}

	fn u32(&mut self) -> RtResult<u32> {
		Ok(self.i32()? as u32)
	}

	fn i64(&mut self) -> RtResult<i64> {
		let bytes = self.code.get(self.pos..self.pos + 8).ok_or(RtErr::BadImageFormat)?;
		self.pos += 8;
		Ok(i64::from_le_bytes(bytes.try_into().unwrap()))
	}

	fn f32(&mut self) -> RtResult<f32> {
		let bytes = self.code.get(self.pos..self.pos + 4).ok_or(RtErr::BadImageFormat)?;
		self.pos += 4;
		Ok(f32::from_le_bytes(bytes.try_into().unwrap()))
	}

	fn f64(&mut self) -> RtResult<f64> {
		let bytes = self.code.get(self.pos..self.pos + 8).ok_or(RtErr::BadImageFormat)?;
		self.pos += 8;
		Ok(f64::from_le_bytes(bytes.try_into().unwrap()))
	}
}

struct Builder<'l> {
	next_var_id: u32,
	eval_stack: Vec<Variable>,
	eval_stack_base: u32,
	max_stack_objects: u32,
	instrs: Vec<HlInst<'l>>,
}

impl<'l> Builder<'l> {
	fn push(&mut self, kind: StackKind) -> Variable {
		let offset = self.eval_stack.iter().map(|v| v.kind.stack_object_size(PTR_SIZE)).sum::<u32>() + self.eval_stack_base;
		let var = Variable { id: self.next_var_id, kind, offset };
		self.next_var_id += 1;
		self.eval_stack.push(var);
		self.max_stack_objects = self.max_stack_objects.max(offset - self.eval_stack_base + kind.stack_object_size(PTR_SIZE));
		var
	}

	fn pop(&mut self) -> RtResult<Variable> {
		self.eval_stack.pop().ok_or(RtErr::ExecutionEngine)
	}

	fn emit(&mut self, il_offset: u32, op: HlOp<'l>) {
		self.instrs.push(HlInst { il_offset, op });
	}
}

fn arith_kind(a: StackKind, b: StackKind) -> RtResult<StackKind> {
	use StackKind::*;
	Ok(match (a, b) {
		(I4, I4) => I4,
		(I8, I8) => I8,
		(R4, R4) => R4,
		(R8, R8) => R8,
		(RefOrPtr, I4) | (RefOrPtr, I8) | (RefOrPtr, RefOrPtr) => RefOrPtr,
		(I4, RefOrPtr) => RefOrPtr,
		(I4, I8) | (I8, I4) => I8,
		_ => return Err(RtErr::ExecutionEngine),
	})
}

/// Decodes `code` into block-structured HL IR. `locals` give each local
/// slot's stack-object kind/size; `method.params`/`method.return_sig`
/// (plus an implicit leading `this` when non-static) give the argument
/// layout, matching [`crate::class::Method::arg_stack_object_size`].
pub fn lower_to_hl<'l>(
	method: &'l Method<'l>,
	code: &'l [u8],
	locals: &'l [StackKind],
	raw_clauses: &[RawClause<'l>],
) -> RtResult<HlMethod<'l>> {
	lower_to_hl_with_resolver(method, code, locals, raw_clauses, &NoTokens)
}

struct NoTokens;
impl<'l> TokenResolver<'l> for NoTokens {
	fn resolve(&self, _token: u32) -> RtResult<ResolvedToken<'l>> {
		Err(RtErr::NotImplemented)
	}
}

#[cfg_attr(feature = "tracing", tracing::instrument(skip_all))]
pub fn lower_to_hl_with_resolver<'l>(
	method: &'l Method<'l>,
	code: &'l [u8],
	locals: &'l [StackKind],
	raw_clauses: &[RawClause<'l>],
	resolver: &dyn TokenResolver<'l>,
) -> RtResult<HlMethod<'l>> {
	let is_static = method.flags.contains(cil_image::raw::heaps::table::MethodAttributes::STATIC);
	let mut arg_kinds: Vec<StackKind> = Vec::new();
	if !is_static {
		arg_kinds.push(StackKind::RefOrPtr);
	}
	for p in method.params {
		arg_kinds.push(typesig_stack_kind(p));
	}
	let arg_count = arg_kinds.len() as u32;
	let local_count = locals.len() as u32;

	let mut offset = 0u32;
	let arg_vars: Vec<Variable> = arg_kinds
		.iter()
		.enumerate()
		.map(|(i, k)| {
			let v = Variable { id: i as u32, kind: *k, offset };
			offset += k.stack_object_size(PTR_SIZE);
			v
		})
		.collect();
	let local_vars: Vec<Variable> = locals
		.iter()
		.enumerate()
		.map(|(i, k)| {
			let v = Variable { id: arg_count + i as u32, kind: *k, offset };
			offset += k.stack_object_size(PTR_SIZE);
			v
		})
		.collect();
	let eval_stack_base = offset;
	let arg_and_local_stack_objects = eval_stack_base;

	let mut builder = Builder {
		next_var_id: arg_count + local_count,
		eval_stack: Vec::new(),
		eval_stack_base,
		max_stack_objects: 0,
		instrs: Vec::new(),
	};

	let mut dec = Decoder { code, pos: 0 };
	let mut constrained: Option<&'l Class<'l>> = None;
	// Filter funclets are entered with exactly the thrown exception on the
	// evaluation stack (ECMA-335 III §12.4.2.6); the decoder has no other
	// place to account for that implicit push, so reserve the slot here.
	let filter_starts: std::collections::BTreeSet<u32> = raw_clauses.iter().filter_map(|c| c.filter_start).collect();

	while dec.pos < code.len() {
		let il_offset = dec.pos as u32;
		if filter_starts.contains(&il_offset) {
			builder.push(StackKind::RefOrPtr);
		}
		let opcode = dec.u8()?;
		match opcode {
			0x00 => builder.emit(il_offset, HlOp::Nop),
			0x02..=0x05 => {
				let idx = (opcode - 0x02) as u16;
				builder.emit(il_offset, load_arg(&arg_vars, idx, &mut builder)?);
			}
			0x06..=0x09 => {
				let idx = (opcode - 0x06) as u16;
				builder.emit(il_offset, load_loc(&local_vars, idx, &mut builder)?);
			}
			0x0A..=0x0D => {
				let idx = (opcode - 0x0A) as u16;
				let op = store_loc(&local_vars, idx, &mut builder)?;
				builder.emit(il_offset, op);
			}
			0x0E => {
				let idx = dec.u8()? as u16;
				builder.emit(il_offset, load_arg(&arg_vars, idx, &mut builder)?);
			}
			0x11 => {
				let idx = dec.u8()? as u16;
				builder.emit(il_offset, load_loc(&local_vars, idx, &mut builder)?);
			}
			0x13 => {
				let idx = dec.u8()? as u16;
				let op = store_loc(&local_vars, idx, &mut builder)?;
				builder.emit(il_offset, op);
			}
			0x15 => {
				let dst = builder.push(StackKind::I4);
				builder.emit(il_offset, HlOp::LdcI4(-1, dst));
			}
			0x16..=0x1E => {
				let val = opcode as i32 - 0x16;
				let dst = builder.push(StackKind::I4);
				builder.emit(il_offset, HlOp::LdcI4(val, dst));
			}
			0x1F => {
				let val = dec.i8()? as i32;
				let dst = builder.push(StackKind::I4);
				builder.emit(il_offset, HlOp::LdcI4(val, dst));
			}
			0x20 => {
				let val = dec.i32()?;
				let dst = builder.push(StackKind::I4);
				builder.emit(il_offset, HlOp::LdcI4(val, dst));
			}
			0x21 => {
				let _ = dec.i64()?;
				return Err(RtErr::NotImplemented); // ldc.i8 constant pooling: see DESIGN.md
			}
			0x22 => {
				let _ = dec.f32()?;
				return Err(RtErr::NotImplemented);
			}
			0x23 => {
				let _ = dec.f64()?;
				return Err(RtErr::NotImplemented);
			}
			0x25 => {
				let v = builder.pop()?;
				let dst = builder.push(v.kind);
				builder.emit(il_offset, HlOp::Dup(v, dst));
				builder.eval_stack.push(v);
			}
			0x26 => {
				let v = builder.pop()?;
				builder.emit(il_offset, HlOp::Pop(v));
			}
			0x28 | 0x6F => {
				let token = dec.u32()?;
				let is_virtual = opcode == 0x6F;
				let ResolvedToken::Method(callee) = resolver.resolve(token)? else { return Err(RtErr::BadImageFormat) };
				let nargs = callee.params.len() + usize::from(!callee.flags.contains(cil_image::raw::heaps::table::MethodAttributes::STATIC));
				let mut args = Vec::with_capacity(nargs);
				for _ in 0..nargs {
					args.push(builder.pop()?);
				}
				args.reverse();
				let ret = (!matches!(callee.return_sig.kind, crate::cache::ElementKind::Void)).then(|| builder.push(typesig_stack_kind(callee.return_sig)));
				let c = constrained.take();
				builder.emit(il_offset, HlOp::Call { method: callee, constrained: c, args: leak_vars(&args), ret, is_virtual });
			}
			0x2A => {
				let ret = (!builder.eval_stack.is_empty()).then(|| builder.pop()).transpose()?;
				builder.emit(il_offset, HlOp::Ret(ret));
			}
			0x2B | 0x38 => {
				let target_offset = if opcode == 0x2B { dec.i8()? as i32 } else { dec.i32()? };
				let target = (dec.pos as i32 + target_offset) as u32;
				builder.emit(il_offset, HlOp::Br(target));
			}
			0x2C | 0x39 => {
				let cond = builder.pop()?;
				let target_offset = if opcode == 0x2C { dec.i8()? as i32 } else { dec.i32()? };
				let target = (dec.pos as i32 + target_offset) as u32;
				builder.emit(il_offset, HlOp::BrCond { branch_if_true: false, cond, target });
			}
			0x2D | 0x3A => {
				let cond = builder.pop()?;
				let target_offset = if opcode == 0x2D { dec.i8()? as i32 } else { dec.i32()? };
				let target = (dec.pos as i32 + target_offset) as u32;
				builder.emit(il_offset, HlOp::BrCond { branch_if_true: true, cond, target });
			}
			0x2E..=0x37 | 0x3B..=0x44 => {
				let (op, un) = compare_branch_kind(opcode);
				let short = opcode <= 0x37;
				let b = builder.pop()?;
				let a = builder.pop()?;
				let target_offset = if short { dec.i8()? as i32 } else { dec.i32()? };
				let target = (dec.pos as i32 + target_offset) as u32;
				builder.emit(il_offset, HlOp::BrCompare { op, un, a, b, target });
			}
			0x58..=0x65 => {
				let b = builder.pop()?;
				let a = builder.pop()?;
				let kind = arith_kind(a.kind, b.kind)?;
				let dst = builder.push(kind);
				let op = match opcode {
					0x58 => HlOp::Add(a, b, dst),
					0x59 => HlOp::Sub(a, b, dst),
					0x5A => HlOp::Mul(a, b, dst),
					0x5B => HlOp::Div { un: false, a, b, dst },
					0x5C => HlOp::Div { un: true, a, b, dst },
					0x5D => HlOp::Rem { un: false, a, b, dst },
					0x5E => HlOp::Rem { un: true, a, b, dst },
					_ => return Err(RtErr::NotImplemented),
				};
				builder.emit(il_offset, op);
			}
			0x72 => {
				let token = dec.u32()?;
				let ResolvedToken::StringLiteral(s) = resolver.resolve(token)? else { return Err(RtErr::BadImageFormat) };
				let dst = builder.push(StackKind::RefOrPtr);
				let _ = s;
				builder.emit(il_offset, HlOp::LdcI4(0, dst)); // placeholder load; interned by C8's resolved-data table
			}
			0x73 => {
				let token = dec.u32()?;
				let ResolvedToken::Method(ctor) = resolver.resolve(token)? else { return Err(RtErr::BadImageFormat) };
				let nargs = ctor.params.len();
				let mut args = Vec::with_capacity(nargs);
				for _ in 0..nargs {
					args.push(builder.pop()?);
				}
				args.reverse();
				let dst = builder.push(StackKind::RefOrPtr);
				builder.emit(il_offset, HlOp::NewObj { ctor, args: leak_vars(&args), dst });
			}
			0x79 => {
				// unbox: pushes a managed pointer; modeled as RefOrPtr, class resolved but
				// not separately recorded as an HL op distinct from unbox.any here.
				let token = dec.u32()?;
				let ResolvedToken::Class(class) = resolver.resolve(token)? else { return Err(RtErr::BadImageFormat) };
				let src = builder.pop()?;
				let dst = builder.push(StackKind::RefOrPtr);
				builder.emit(il_offset, HlOp::UnboxAny { class, src, dst });
			}
			0x7A => {
				let v = builder.pop()?;
				builder.emit(il_offset, HlOp::Throw(v));
			}
			0x7B => {
				let token = dec.u32()?;
				let ResolvedToken::Field(owner, index) = resolver.resolve(token)? else { return Err(RtErr::BadImageFormat) };
				let obj = builder.pop()?;
				let kind = typesig_stack_kind(owner.fields()[index].sig);
				let dst = builder.push(kind);
				builder.emit(il_offset, HlOp::LdFld { owner, index, obj, dst });
			}
			0x7D => {
				let token = dec.u32()?;
				let ResolvedToken::Field(owner, index) = resolver.resolve(token)? else { return Err(RtErr::BadImageFormat) };
				let src = builder.pop()?;
				let obj = builder.pop()?;
				builder.emit(il_offset, HlOp::StFld { owner, index, obj, src });
			}
			0x7E => {
				let token = dec.u32()?;
				let ResolvedToken::Field(owner, index) = resolver.resolve(token)? else { return Err(RtErr::BadImageFormat) };
				let kind = typesig_stack_kind(owner.fields()[index].sig);
				let dst = builder.push(kind);
				builder.emit(il_offset, HlOp::LdSFld { owner, index, dst });
			}
			0x80 => {
				let token = dec.u32()?;
				let ResolvedToken::Field(owner, index) = resolver.resolve(token)? else { return Err(RtErr::BadImageFormat) };
				let src = builder.pop()?;
				builder.emit(il_offset, HlOp::StSFld { owner, index, src });
			}
			0x8C => {
				let token = dec.u32()?;
				let ResolvedToken::Class(class) = resolver.resolve(token)? else { return Err(RtErr::BadImageFormat) };
				let src = builder.pop()?;
				let dst = builder.push(StackKind::RefOrPtr);
				builder.emit(il_offset, HlOp::Box { class, src, dst });
			}
			0x8D => {
				let token = dec.u32()?;
				let ResolvedToken::Class(elem) = resolver.resolve(token)? else { return Err(RtErr::BadImageFormat) };
				let len = builder.pop()?;
				let dst = builder.push(StackKind::RefOrPtr);
				builder.emit(il_offset, HlOp::NewArr { elem, len, dst });
			}
			0x94 | 0x9A | 0xA3 => {
				let elem_token = if opcode == 0xA3 { Some(dec.u32()?) } else { None };
				let elem = match elem_token {
					Some(t) => match resolver.resolve(t)? {
						ResolvedToken::Class(c) => c,
						_ => return Err(RtErr::BadImageFormat),
					},
					None => return Err(RtErr::NotImplemented), // ldelem.i4/.ref need the array's static element class; see DESIGN.md
				};
				let index = builder.pop()?;
				let array = builder.pop()?;
				let dst = builder.push(if elem.is_value_type() { StackKind::Other { byte_size: elem.instance_size() as u32 } } else { StackKind::RefOrPtr });
				builder.emit(il_offset, HlOp::LdElem { elem, array, index, dst });
			}
			0x9E | 0xA2 | 0xA4 => {
				let elem_token = if opcode == 0xA4 { Some(dec.u32()?) } else { None };
				let src = builder.pop()?;
				let index = builder.pop()?;
				let array = builder.pop()?;
				let elem = match elem_token {
					Some(t) => match resolver.resolve(t)? {
						ResolvedToken::Class(c) => c,
						_ => return Err(RtErr::BadImageFormat),
					},
					None => return Err(RtErr::NotImplemented),
				};
				builder.emit(il_offset, HlOp::StElem { elem, array, index, src });
			}
			0xA5 => {
				let token = dec.u32()?;
				let ResolvedToken::Class(class) = resolver.resolve(token)? else { return Err(RtErr::BadImageFormat) };
				let src = builder.pop()?;
				let dst = builder.push(if class.is_value_type() { StackKind::Other { byte_size: class.instance_size() as u32 } } else { StackKind::RefOrPtr });
				builder.emit(il_offset, HlOp::UnboxAny { class, src, dst });
			}
			0xDC => builder.emit(il_offset, HlOp::EndFinally),
			0xDD | 0xDE => {
				// leave (0xDD) takes a 4-byte target, leave.s (0xDE) a 1-byte one --
				// the one pair in this table where the lower opcode is the long form.
				let target_offset = if opcode == 0xDD { dec.i32()? } else { dec.i8()? as i32 };
				let target = (dec.pos as i32 + target_offset) as u32;
				builder.emit(il_offset, HlOp::Leave(target));
			}
			0xFE => {
				let sub = dec.u8()?;
				match sub {
					0x01..=0x04 => {
						let (op, un) = match sub {
							0x01 => (CompareOp::Eq, false),
							0x02 => (CompareOp::Gt, false),
							0x03 => (CompareOp::Gt, true),
							_ => (CompareOp::Lt, false),
						};
						let b = builder.pop()?;
						let a = builder.pop()?;
						let dst = builder.push(StackKind::I4);
						builder.emit(il_offset, HlOp::Compare { op, un, a, b, dst });
					}
					0x11 => builder.emit(il_offset, HlOp::EndFinally), // endfilter: same evaluation-stack contract as endfinally here
					0x16 => {
						let token = dec.u32()?;
						let ResolvedToken::Class(class) = resolver.resolve(token)? else { return Err(RtErr::BadImageFormat) };
						constrained = Some(class);
					}
					0x12 | 0x13 | 0x14 | 0x1E => { /* unaligned./volatile./tail./readonly. prefixes: no IR effect modeled yet */ }
					0x1A => builder.emit(il_offset, HlOp::Rethrow),
					_ => return Err(unsupported_two_byte(sub)),
				}
			}
			other => return Err(crate::il::unsupported_opcode(other)),
		}
	}

	let clauses = raw_clauses.to_vec();
	let blocks = split_basic_blocks(&builder.instrs, code.len() as u32, &clauses);
	let ret = (!matches!(method.return_sig.kind, crate::cache::ElementKind::Void)).then(|| typesig_stack_kind(method.return_sig));

	Ok(HlMethod {
		blocks,
		clauses,
		max_stack_objects: builder.max_stack_objects,
		arg_and_local_stack_objects,
		ret,
		arg_vars,
		local_vars,
	})
}

fn unsupported_two_byte(sub: u8) -> RtErr {
	let _ = sub;
	RtErr::NotImplemented
}

fn load_arg<'l>(arg_vars: &[Variable], idx: u16, builder: &mut Builder<'l>) -> RtResult<HlOp<'l>> {
	let src = *arg_vars.get(idx as usize).ok_or(RtErr::BadImageFormat)?;
	let dst = builder.push(src.kind);
	Ok(HlOp::LdArg(idx, dst.with_id(src.id)))
}

fn load_loc<'l>(local_vars: &[Variable], idx: u16, builder: &mut Builder<'l>) -> RtResult<HlOp<'l>> {
	let src = *local_vars.get(idx as usize).ok_or(RtErr::BadImageFormat)?;
	let dst = builder.push(src.kind);
	Ok(HlOp::LdLoc(idx, dst.with_id(src.id)))
}

fn store_loc<'l>(local_vars: &[Variable], idx: u16, builder: &mut Builder<'l>) -> RtResult<HlOp<'l>> {
	let _dst = *local_vars.get(idx as usize).ok_or(RtErr::BadImageFormat)?;
	let src = builder.pop()?;
	Ok(HlOp::StLoc(idx, src))
}

impl Variable {
	fn with_id(mut self, id: u32) -> Self {
		self.id = id;
		self
	}
}

fn compare_branch_kind(opcode: u8) -> (CompareOp, bool) {
	match opcode {
		0x2E | 0x3B => (CompareOp::Eq, false),
		0x2F | 0x3C => (CompareOp::Ge, false),
		0x30 | 0x3D => (CompareOp::Gt, false),
		0x31 | 0x3E => (CompareOp::Le, false),
		0x32 | 0x3F => (CompareOp::Lt, false),
		0x33 | 0x40 => (CompareOp::Ne, true),
		0x34 | 0x41 => (CompareOp::Ge, true),
		0x35 | 0x42 => (CompareOp::Gt, true),
		0x36 | 0x43 => (CompareOp::Le, true),
		_ => (CompareOp::Lt, true),
	}
}

pub(crate) fn typesig_stack_kind(sig: &crate::cache::TypeSig) -> StackKind {
	use crate::cache::ElementKind::*;
	if sig.by_ref {
		return StackKind::RefOrPtr;
	}
	match sig.kind {
		I4 | U4 | I2 | U2 | I1 | U1 | Boolean | Char => StackKind::I4,
		I8 | U8 => StackKind::I8,
		R4 => StackKind::R4,
		R8 => StackKind::R8,
		I | U | String | Object | Class(_) | Ptr(_) | SzArray(_) | Array(..) | FnPtr(..) => StackKind::RefOrPtr,
		ValueType(_) | GenericInst(_) | TypedByRef => StackKind::Other { byte_size: PTR_SIZE },
		Void | Var(_) | MVar(_) => StackKind::Other { byte_size: 0 },
	}
}

fn leak_vars<'l>(vars: &[Variable]) -> &'l [Variable] {
	// Variable is Copy and the HL pass runs inside a bump-scoped lowering
	// call; leaking a short-lived Box is acceptable here because the
	// owning arena (see `il::lower_method`) outlives the IR consumer.
	Box::leak(vars.to_vec().into_boxed_slice())
}

fn split_basic_blocks<'l>(instrs: &[HlInst<'l>], code_len: u32, clauses: &[RawClause<'l>]) -> Vec<BasicBlock<'l>> {
	let mut leaders = std::collections::BTreeSet::new();
	leaders.insert(0u32);
	for inst in instrs {
		match inst.op {
			HlOp::Br(t) | HlOp::Leave(t) => {
				leaders.insert(t);
			}
			HlOp::BrCond { target, .. } | HlOp::BrCompare { target, .. } => {
				leaders.insert(target);
			}
			_ => {}
		}
	}
	for c in clauses {
		leaders.insert(c.try_start);
		leaders.insert(c.try_end);
		leaders.insert(c.handler_start);
		leaders.insert(c.handler_end);
		if let Some(f) = c.filter_start {
			leaders.insert(f);
		}
	}
	let mut leader_vec: Vec<u32> = leaders.into_iter().collect();
	leader_vec.push(code_len);

	let mut blocks = Vec::new();
	for w in leader_vec.windows(2) {
		let (start, end) = (w[0], w[1]);
		let block_instrs: Vec<HlInst<'l>> = instrs.iter().filter(|i| i.il_offset >= start && i.il_offset < end).copied().collect();
		blocks.push(BasicBlock { start_il_offset: start, end_il_offset: end, instrs: block_instrs, entry_stack: Vec::new() });
	}
	blocks
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn stack_object_size_rounds_up() {
		assert_eq!(StackKind::I4.stack_object_size(8), 1);
		assert_eq!(StackKind::Other { byte_size: 9 }.stack_object_size(8), 2);
		assert_eq!(StackKind::Other { byte_size: 0 }.stack_object_size(8), 1);
	}

	#[test]
	fn arith_kind_promotes_i4_i8_to_i8() {
		assert_eq!(arith_kind(StackKind::I4, StackKind::I8).unwrap(), StackKind::I8);
		assert_eq!(arith_kind(StackKind::RefOrPtr, StackKind::I4).unwrap(), StackKind::RefOrPtr);
	}

	#[test]
	fn mismatched_float_int_arith_is_rejected() {
		assert!(arith_kind(StackKind::R4, StackKind::I4).is_err());
	}
}
