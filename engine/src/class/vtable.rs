//! Vtable construction (C6, invoked as part of C3's `initialize_vtables`),
//! grounded in `original_source/.../vm/method.cpp`
//! (`get_virtual_method_impl_on_klass`, `get_interface_method_invoke_data`).

use std::cell::Cell;

use bumpalo::Bump;

use crate::class::{Class, Method, MethodImpl};
use crate::error::RtResult;

#[derive(Debug)]
pub struct VirtualInvokeData<'l> {
	pub decl: &'l Method<'l>,
	impl_: Cell<&'l Method<'l>>,
}

impl<'l> VirtualInvokeData<'l> {
	pub fn impl_method(&self) -> &'l Method<'l> {
		self.impl_.get()
	}

	pub fn set_impl(&self, m: &'l Method<'l>) {
		self.impl_.set(m);
	}
}

/// Two methods "match" for override purposes when their names are
/// byte-identical and they take the same number of parameters. Full
/// structural signature comparison (spec.md §4.3: "treating generic
/// parameters positionally") is not yet wired through the param TypeSig
/// equality check below; see DESIGN.md.
fn methods_match(a: &Method, b: &Method) -> bool {
	a.name == b.name && a.params.len() == b.params.len() && std::ptr::eq(a.return_sig, b.return_sig)
		&& a.params.iter().zip(b.params).all(|(x, y)| std::ptr::eq(*x, *y))
}

/// Builds `class`'s vtable and interface-offset table. Requires `class`'s
/// `METHODS` and `INTERFACES` phases to already have run.
pub fn build_vtable<'l>(
	bump: &'l Bump,
	class: &'l Class<'l>,
	method_impls: &[MethodImpl<'l>],
) -> RtResult<(&'l [VirtualInvokeData<'l>], &'l [(&'l Class<'l>, usize)])> {
	let mut vtable: Vec<VirtualInvokeData<'l>> = Vec::new();

	if let Some(parent) = class.parent() {
		for entry in parent.vtable() {
			vtable.push(VirtualInvokeData { decl: entry.decl, impl_: Cell::new(entry.impl_method()) });
		}
	}

	for method in class.methods() {
		if !method.is_virtual() {
			continue;
		}

		if !method.is_new_slot() {
			if let Some(slot) = vtable.iter().position(|v| methods_match(v.decl, method)) {
				vtable[slot].set_impl(method);
				method.set_slot(slot as u32);
				continue;
			}
		}

		let slot = vtable.len() as u32;
		vtable.push(VirtualInvokeData { decl: method, impl_: Cell::new(method) });
		method.set_slot(slot);
	}

	// MethodImpl rows override whatever the name/signature search above
	// picked, regardless of match: explicit interface implementations and
	// covariant-return overrides both rely on this taking precedence.
	for mi in method_impls {
		if let Some(slot) = vtable.iter().position(|v| std::ptr::eq(v.decl, mi.declaration)) {
			vtable[slot].set_impl(mi.body);
		}
	}

	let mut offsets: Vec<(&'l Class<'l>, usize)> = Vec::new();
	for iface in class.interfaces() {
		if let Some((_, base)) = class.interface_offsets().iter().find(|(i, _)| std::ptr::eq(*i, *iface)) {
			offsets.push((iface, *base));
			continue;
		}

		let base = vtable.len();
		for islot in iface.vtable() {
			let chosen = vtable
				.iter()
				.find(|v| methods_match(v.decl, islot.decl))
				.map(|v| v.impl_method())
				.unwrap_or(islot.impl_method());
			vtable.push(VirtualInvokeData { decl: islot.decl, impl_: Cell::new(chosen) });
		}
		offsets.push((iface, base));
	}

	Ok((bump.alloc_slice_fill_with(vtable.len(), |_| vtable.remove(0)), bump.alloc_slice_copy(&offsets)))
}
