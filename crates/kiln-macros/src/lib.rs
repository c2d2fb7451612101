use proc_macro::TokenStream;

use quote::quote;
use syn::{
    Attribute, Expr, ExprArray, ExprLit, ExprPath, ItemStruct, Lit, Meta, Token, parse::Parser,
    spanned::Spanned,
};

/// Declares a lifecycle phase task.
///
/// ```ignore
/// #[Task(
///     id = "recipe.build",
///     module = "recipe",
///     phase = Build,
///     after = ["phase:generate?"],
///     provides = ["phase:build"],
///     label = "Configure and compile"
/// )]
/// pub struct BuildTask;
/// ```
///
/// The struct must provide `run` and `preview`, both
/// `fn(&Invocation, &mut ExecCtx) -> Result<()>`; `preview` is called instead
/// of `run` on dry runs.
#[proc_macro_attribute]
#[allow(non_snake_case)]
pub fn Task(attr: TokenStream, item: TokenStream) -> TokenStream {
    match task_impl(attr, item) {
        Ok(ts) => ts,
        Err(e) => e.to_compile_error().into(),
    }
}

/// Declares a module: which recipe documents it handles and its tasks.
#[proc_macro_attribute]
#[allow(non_snake_case)]
pub fn Module(attr: TokenStream, item: TokenStream) -> TokenStream {
    match module_impl(attr, item) {
        Ok(ts) => ts,
        Err(e) => e.to_compile_error().into(),
    }
}

fn lit_str(expr: &Expr) -> syn::Result<String> {
    match expr {
        Expr::Lit(ExprLit {
            lit: Lit::Str(s), ..
        }) => Ok(s.value()),
        _ => Err(syn::Error::new(expr.span(), "expected string literal")),
    }
}

fn expr_ident(expr: &Expr) -> syn::Result<syn::Ident> {
    match expr {
        Expr::Path(ExprPath { path, .. }) => path
            .get_ident()
            .cloned()
            .ok_or_else(|| syn::Error::new(expr.span(), "expected a bare identifier")),
        _ => Err(syn::Error::new(expr.span(), "expected identifier")),
    }
}

fn expr_array_strings(expr: &Expr) -> syn::Result<Vec<String>> {
    let Expr::Array(ExprArray { elems, .. }) = expr else {
        return Err(syn::Error::new(expr.span(), "expected array literal"));
    };
    elems.iter().map(lit_str).collect()
}

fn expr_array_paths(expr: &Expr) -> syn::Result<Vec<syn::Path>> {
    let Expr::Array(ExprArray { elems, .. }) = expr else {
        return Err(syn::Error::new(expr.span(), "expected array literal"));
    };
    let mut out = Vec::new();
    for e in elems {
        match e {
            Expr::Path(ExprPath { path, .. }) => out.push(path.clone()),
            _ => return Err(syn::Error::new(e.span(), "expected path (identifier)")),
        }
    }
    Ok(out)
}

fn drop_our_attrs(attrs: &[Attribute]) -> Vec<Attribute> {
    attrs
        .iter()
        .filter(|a| {
            let Meta::Path(p) = &a.meta else {
                return true;
            };
            let Some(ident) = p.get_ident() else {
                return true;
            };
            ident != "Task" && ident != "Module"
        })
        .cloned()
        .collect()
}

fn name_values(attr: TokenStream) -> syn::Result<Vec<(String, Expr)>> {
    let parser = syn::punctuated::Punctuated::<Meta, Token![,]>::parse_terminated;
    let mut out = Vec::new();
    for m in parser.parse(attr)? {
        let Meta::NameValue(nv) = m else {
            return Err(syn::Error::new(m.span(), "expected key = value"));
        };
        let Some(key) = nv.path.get_ident().map(|i| i.to_string()) else {
            return Err(syn::Error::new(nv.path.span(), "expected ident key"));
        };
        out.push((key, nv.value));
    }
    Ok(out)
}

fn task_impl(attr: TokenStream, item: TokenStream) -> syn::Result<TokenStream> {
    let mut st: ItemStruct = syn::parse(item)?;
    st.attrs = drop_our_attrs(&st.attrs);
    let struct_ident = st.ident.clone();

    let mut id: Option<String> = None;
    let mut module: Option<String> = None;
    let mut phase: Option<syn::Ident> = None;
    let mut provides: Vec<String> = Vec::new();
    let mut after: Vec<String> = Vec::new();
    let mut label: Option<String> = None;

    for (key, v) in name_values(attr)? {
        match key.as_str() {
            "id" => id = Some(lit_str(&v)?),
            "module" => module = Some(lit_str(&v)?),
            "phase" => phase = Some(expr_ident(&v)?),
            "provides" => provides = expr_array_strings(&v)?,
            "after" => after = expr_array_strings(&v)?,
            "label" => label = Some(lit_str(&v)?),
            other => {
                return Err(syn::Error::new(
                    v.span(),
                    format!("unknown Task attribute key '{other}'"),
                ));
            }
        }
    }

    let missing = |what: &str| syn::Error::new(struct_ident.span(), format!("Task: missing {what}"));
    let id = id.ok_or_else(|| missing("id"))?;
    let module = module.ok_or_else(|| missing("module"))?;
    let phase = phase.ok_or_else(|| missing("phase"))?;
    let label = label.ok_or_else(|| missing("label"))?;
    if !id.starts_with(&format!("{module}.")) {
        return Err(syn::Error::new(
            struct_ident.span(),
            "Task: id must start with '<module>.'",
        ));
    }

    let expanded = quote! {
        #st

        impl #struct_ident {
            pub const ID: &'static str = #id;
            pub const MODULE: &'static str = #module;
            pub const PHASE: crate::lifecycle::Phase = crate::lifecycle::Phase::#phase;
            pub const LABEL: &'static str = #label;

            pub fn plan(plan: &mut crate::planner::Plan) -> crate::Result<()> {
                plan.add(crate::planner::Task {
                    id: Self::ID.to_string(),
                    label: Self::LABEL.to_string(),
                    module: Self::MODULE.to_string(),
                    phase: Self::PHASE,
                    after: vec![#(#after.to_string()),*],
                    provides: vec![#(#provides.to_string()),*],
                })
            }

            pub fn exec(
                inv: &crate::lifecycle::Invocation,
                ctx: &mut crate::executor::ExecCtx,
            ) -> crate::Result<()> {
                if ctx.cancelled() {
                    return Err(crate::Error::Cancelled.in_phase(Self::PHASE));
                }
                let res = if ctx.dry_run {
                    ctx.log(&format!("DRY-RUN: {}", Self::LABEL));
                    Self::preview(inv, ctx)
                } else {
                    Self::run(inv, ctx)
                };
                res.map_err(|e| e.in_phase(Self::PHASE))
            }
        }
    };

    Ok(expanded.into())
}

fn module_impl(attr: TokenStream, item: TokenStream) -> syn::Result<TokenStream> {
    let mut st: ItemStruct = syn::parse(item)?;
    st.attrs = drop_our_attrs(&st.attrs);
    let struct_ident = st.ident.clone();

    let mut id: Option<String> = None;
    let mut detect: Option<String> = None;
    let mut tasks: Option<Vec<syn::Path>> = None;

    for (key, v) in name_values(attr)? {
        match key.as_str() {
            "id" => id = Some(lit_str(&v)?),
            "detect" => detect = Some(lit_str(&v)?),
            "tasks" => tasks = Some(expr_array_paths(&v)?),
            other => {
                return Err(syn::Error::new(
                    v.span(),
                    format!("unknown Module attribute key '{other}'"),
                ));
            }
        }
    }

    let id = id.ok_or_else(|| syn::Error::new(struct_ident.span(), "Module: missing id"))?;
    let tasks = tasks.ok_or_else(|| syn::Error::new(struct_ident.span(), "Module: missing tasks"))?;
    // Without an explicit table the module claims documents with a table named after it.
    let detect = detect.unwrap_or_else(|| id.clone());

    let call_tasks = tasks.iter().map(|p| quote! { #p::plan(plan)?; });
    let reg_tasks = tasks.iter().map(|p| quote! { reg.add(#p::ID, #p::exec)?; });

    let expanded = quote! {
        #st

        impl crate::modules::Module for #struct_ident {
            fn id(&self) -> &'static str {
                #id
            }

            fn detect(&self, doc: &crate::config::ConfigDoc) -> bool {
                doc.has_table_path(#detect)
            }

            fn plan(&self, plan: &mut crate::planner::Plan) -> crate::Result<()> {
                #(#call_tasks)*
                Ok(())
            }
        }

        impl crate::executor::ModuleExec for #struct_ident {
            fn register_tasks(reg: &mut crate::executor::TaskRegistry) -> crate::Result<()> {
                #(#reg_tasks)*
                Ok(())
            }
        }
    };

    Ok(expanded.into())
}
