//! Array store-check assignability (supplemented feature, SPEC_FULL.md §3),
//! grounded in `original_source/.../vm/class.h`'s `is_assignable_from` /
//! `is_assignable_from_interface` / `is_pointer_element_compatible_with`.
//! Backs S6 (array covariance).

use crate::class::Class;

/// `true` when a value of class `from` may be stored where `to` is
/// expected — i.e. `from` is `to`, derives from it, or implements it.
pub fn is_assignable_from<'l>(to: &'l Class<'l>, from: &'l Class<'l>) -> bool {
	if std::ptr::eq(to, from) {
		return true;
	}
	if to.flags().contains(crate::class::ClassFlags::INTERFACE) {
		return is_assignable_from_interface(to, from);
	}
	let mut cur = Some(from);
	while let Some(c) = cur {
		if std::ptr::eq(c, to) {
			return true;
		}
		cur = c.parent();
	}
	false
}

fn is_assignable_from_interface<'l>(iface: &'l Class<'l>, from: &'l Class<'l>) -> bool {
	let mut cur = Some(from);
	while let Some(c) = cur {
		if c.interfaces().iter().any(|i| std::ptr::eq(*i, iface)) {
			return true;
		}
		cur = c.parent();
	}
	false
}

/// Assignability for array element stores (spec.md §8 invariant 9 / S6):
/// `object[]` accepts any reference-typed element whose class is
/// assignable to the array's element class; value-typed arrays require an
/// exact element-class match (no variance).
pub fn is_array_element_assignable<'l>(array_element_class: &'l Class<'l>, value_class: &'l Class<'l>) -> bool {
	if array_element_class.is_value_type() || value_class.is_value_type() {
		return std::ptr::eq(array_element_class, value_class);
	}
	is_assignable_from(array_element_class, value_class)
}

#[cfg(test)]
mod tests {
	// Exercised end-to-end by `engine/tests/scenarios.rs`'s S6 scenario,
	// which needs a populated `Class` graph (parent chain, interfaces);
	// building one purely in a unit test would just duplicate that setup.
}
