use proc_macro::TokenStream;
use proc_macro2::TokenStream as TokenStream2;
use quote::quote;
use syn::punctuated::Punctuated;
use syn::spanned::Spanned;
use syn::{
    ExprPath, Ident, Item, LitInt, LitStr, Member, Result, Token, Type, parse::Parse,
    parse::ParseStream, parse_macro_input,
};

/// #[command] 宏实现
/// 支持具名字段、tuple 与 unit 结构体；剥离字段上的 `#[lock_key]` 辅助属性后原样输出结构体，
/// 并追加 `Command` 实现。
pub(crate) fn expand(attr: TokenStream, item: TokenStream) -> TokenStream {
    let cfg = parse_macro_input!(attr as CommandAttrConfig);
    let input = parse_macro_input!(item as Item);

    let mut st = match input {
        Item::Struct(s) => s,
        other => {
            return syn::Error::new(other.span(), "#[command] only on struct")
                .to_compile_error()
                .into();
        }
    };

    // 收集锁键字段，同时移除辅助属性
    let mut lock_fields = Vec::new();
    for (index, field) in st.fields.iter_mut().enumerate() {
        let mut opts: Option<LockKeyOpts> = None;
        for attr in field.attrs.iter().filter(|a| a.path().is_ident("lock_key")) {
            if opts.is_some() {
                return syn::Error::new(attr.span(), "duplicate #[lock_key] on field")
                    .to_compile_error()
                    .into();
            }
            match LockKeyOpts::from_attr(attr) {
                Ok(s) => opts = Some(s),
                Err(e) => return e.to_compile_error().into(),
            }
        }
        field.attrs.retain(|a| !a.path().is_ident("lock_key"));

        if let Some(opts) = opts {
            let member = match &field.ident {
                Some(ident) => Member::Named(ident.clone()),
                None => Member::Unnamed(index.into()),
            };
            let optional = is_option(&field.ty);
            if optional && opts.each {
                return syn::Error::new(
                    field.span(),
                    "#[lock_key(each)] does not support Option fields",
                )
                .to_compile_error()
                .into();
            }
            lock_fields.push((member, optional, opts));
        }
    }

    let ident = &st.ident;
    let name = cfg
        .name
        .unwrap_or_else(|| LitStr::new(&ident.to_string(), ident.span()));
    let (impl_generics, ty_generics, where_clause) = st.generics.split_for_impl();

    let concurrent_fn = cfg.sequential.then(|| {
        quote! {
            fn allows_concurrent_execution(&self) -> bool {
                false
            }
        }
    });

    let lock_keys_fn = (!lock_fields.is_empty()).then(|| {
        let pushes = lock_fields.iter().map(|(member, optional, opts)| {
            if *optional {
                let key = opts.render(quote!(value));
                quote! {
                    if let ::std::option::Option::Some(value) = &self.#member {
                        keys.push(#key);
                    }
                }
            } else if opts.each {
                let key = opts.render(quote!(value));
                quote! {
                    for value in &self.#member {
                        keys.push(#key);
                    }
                }
            } else {
                let key = opts.render(quote!(&self.#member));
                quote! { keys.push(#key); }
            }
        });
        quote! {
            fn lock_keys(&self) -> ::std::vec::Vec<::dispatch_domain::lock_key::LockKey> {
                let mut keys = ::std::vec::Vec::new();
                #(#pushes)*
                keys
            }
        }
    });

    let timeout_fn = cfg.timeout_ms.map(|ms| {
        quote! {
            fn timeout(&self) -> ::std::option::Option<::std::time::Duration> {
                ::std::option::Option::Some(::std::time::Duration::from_millis(#ms))
            }
        }
    });

    let on_cancelled_fn = cfg.on_cancelled.map(|path| {
        quote! {
            fn on_cancelled(&self) {
                #path(self)
            }
        }
    });

    let out = quote! {
        #st

        impl #impl_generics ::dispatch_domain::command::Command for #ident #ty_generics #where_clause {
            const NAME: &'static str = #name;

            #concurrent_fn
            #lock_keys_fn
            #timeout_fn
            #on_cancelled_fn
        }
    };

    TokenStream::from(out)
}

fn is_option(ty: &Type) -> bool {
    match ty {
        Type::Path(p) if p.qself.is_none() => p
            .path
            .segments
            .last()
            .map(|s| s.ident == "Option")
            .unwrap_or(false),
        _ => false,
    }
}

// -------- parsing --------

// 解析 command 宏参数：name = "..."、sequential、timeout_ms = N、on_cancelled = path
#[derive(Default)]
struct CommandAttrConfig {
    name: Option<LitStr>,
    sequential: bool,
    timeout_ms: Option<LitInt>,
    on_cancelled: Option<ExprPath>,
}

enum CommandAttrElem {
    Name(Ident, LitStr),
    Sequential(Ident),
    TimeoutMs(Ident, LitInt),
    OnCancelled(Ident, ExprPath),
}

impl Parse for CommandAttrElem {
    fn parse(input: ParseStream) -> Result<Self> {
        let key: Ident = input.parse()?;
        match key.to_string().as_str() {
            "sequential" => Ok(Self::Sequential(key)),
            "name" => {
                input.parse::<Token![=]>()?;
                Ok(Self::Name(key, input.parse()?))
            }
            "timeout_ms" => {
                input.parse::<Token![=]>()?;
                Ok(Self::TimeoutMs(key, input.parse()?))
            }
            "on_cancelled" => {
                input.parse::<Token![=]>()?;
                Ok(Self::OnCancelled(key, input.parse()?))
            }
            _ => Err(syn::Error::new(
                key.span(),
                "unknown key in attribute; expected 'name', 'sequential', 'timeout_ms' or 'on_cancelled'",
            )),
        }
    }
}

impl Parse for CommandAttrConfig {
    fn parse(input: ParseStream) -> Result<Self> {
        let mut cfg = Self::default();
        if input.is_empty() {
            return Ok(cfg);
        }

        let elems: Punctuated<CommandAttrElem, Token![,]> = Punctuated::parse_terminated(input)?;
        for elem in elems {
            match elem {
                CommandAttrElem::Name(key, lit) => {
                    if cfg.name.is_some() {
                        return Err(duplicate(&key));
                    }
                    if lit.value().is_empty() {
                        return Err(syn::Error::new(lit.span(), "command name must not be empty"));
                    }
                    cfg.name = Some(lit);
                }
                CommandAttrElem::Sequential(key) => {
                    if cfg.sequential {
                        return Err(duplicate(&key));
                    }
                    cfg.sequential = true;
                }
                CommandAttrElem::TimeoutMs(key, lit) => {
                    if cfg.timeout_ms.is_some() {
                        return Err(duplicate(&key));
                    }
                    lit.base10_parse::<u64>()?;
                    cfg.timeout_ms = Some(lit);
                }
                CommandAttrElem::OnCancelled(key, path) => {
                    if cfg.on_cancelled.is_some() {
                        return Err(duplicate(&key));
                    }
                    cfg.on_cancelled = Some(path);
                }
            }
        }

        Ok(cfg)
    }
}

fn duplicate(key: &Ident) -> syn::Error {
    syn::Error::new(key.span(), format!("duplicate key '{key}' in attribute"))
}

// 字段级 #[lock_key] / #[lock_key(each, scope = "...")]
#[derive(Default)]
struct LockKeyOpts {
    each: bool,
    scope: Option<LitStr>,
}

impl LockKeyOpts {
    fn from_attr(attr: &syn::Attribute) -> Result<Self> {
        let mut opts = Self::default();
        if matches!(attr.meta, syn::Meta::Path(_)) {
            return Ok(opts);
        }

        attr.parse_nested_meta(|meta| {
            if meta.path.is_ident("each") {
                opts.each = true;
                Ok(())
            } else if meta.path.is_ident("scope") {
                opts.scope = Some(meta.value()?.parse()?);
                Ok(())
            } else {
                Err(meta.error("unknown lock_key option; expected 'each' or 'scope'"))
            }
        })?;
        Ok(opts)
    }

    // value 为引用表达式
    fn render(&self, value: TokenStream2) -> TokenStream2 {
        match &self.scope {
            Some(scope) => quote! {
                ::dispatch_domain::lock_key::LockKey::scoped(#scope, #value)
            },
            None => quote! {
                ::dispatch_domain::lock_key::LockKey::new(::std::string::ToString::to_string(#value))
            },
        }
    }
}
