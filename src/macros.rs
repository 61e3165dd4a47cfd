// Copyright 2023 TiKV Project Authors. Licensed under Apache-2.0.

/// Reduces a type-name probe like `crate::module::caller::f` to the bare
/// name of the enclosing function. Closure frames are skipped; a probe
/// with no usable segment yields `"unknown"`.
#[doc(hidden)]
pub fn short_fn_name(probe: &'static str) -> &'static str {
    let path = probe.strip_suffix("::f").unwrap_or(probe);
    path.rsplit("::")
        .find(|segment| !segment.is_empty() && *segment != "{{closure}}")
        .unwrap_or("unknown")
}

/// Get the name of the function where the macro is invoked. Returns a
/// `&'static str`, or `"unknown"` when no enclosing function name can be
/// derived.
///
/// # Example
///
/// ```
/// use minimon::func_name;
///
/// fn foo() {
///     assert_eq!(func_name!(), "foo");
/// }
/// # foo()
/// ```
#[macro_export]
macro_rules! func_name {
    () => {{
        fn f() {}
        $crate::short_fn_name(::std::any::type_name_of_val(&f))
    }};
}

/// Get the default registry's scope for the invoking module, named by
/// `module_path!()`.
///
/// # Example
///
/// ```
/// use once_cell::sync::Lazy;
/// use minimon::Scope;
///
/// static MON: Lazy<Scope> = Lazy::new(|| minimon::package!());
///
/// MON.counter("started").inc(1);
/// ```
#[macro_export]
macro_rules! package {
    () => {
        $crate::default_registry().package_named(std::module_path!())
    };
}
