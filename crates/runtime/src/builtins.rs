//! Core-module native bindings
//!
//! The fixed vocabulary every module can reach: printing, arithmetic
//! folds, comparisons, sequence operations, dispatch helpers, the module
//! loader and the scheduling/channel primitives.

use crate::channel;
use cedar_core::error::{arity_error, type_error};
use cedar_core::fiber::new_fiber;
use cedar_core::host;
use cedar_core::lambda::{CallContext, Control};
use cedar_core::module::def_global;
use cedar_core::value::Value;

fn value(v: Value) -> Result<Control, Value> {
    Ok(Control::Value(v))
}

fn want(name: &str, args: &[Value], n: usize) -> Result<(), Value> {
    if args.len() != n {
        return Err(arity_error(name, n, args.len()));
    }
    Ok(())
}

fn native_print(args: &[Value], _ctx: &mut CallContext) -> Result<Control, Value> {
    let parts: Vec<String> = args.iter().map(|a| a.to_human_string()).collect();
    println!("{}", parts.join(" "));
    value(Value::nil())
}

fn native_str(args: &[Value], _ctx: &mut CallContext) -> Result<Control, Value> {
    let mut out = String::new();
    for arg in args {
        // user-typed instances may provide their own `str`
        let plain = matches!(
            arg.as_obj().map(|o| &o.payload),
            Some(cedar_core::object::Payload::Plain)
        );
        if plain {
            if let Ok(s) = arg.self_call("str", &[]) {
                out.push_str(&s.to_human_string());
                continue;
            }
        }
        out.push_str(&arg.to_human_string());
    }
    value(Value::string(out))
}

fn native_repr(args: &[Value], _ctx: &mut CallContext) -> Result<Control, Value> {
    want("repr", args, 1)?;
    value(Value::string(args[0].to_repr_string()))
}

fn native_add(args: &[Value], _ctx: &mut CallContext) -> Result<Control, Value> {
    let Some((first, rest)) = args.split_first() else {
        return value(Value::Int(0));
    };
    let mut acc = first.clone();
    for v in rest {
        acc = acc.add(v)?;
    }
    value(acc)
}

fn native_sub(args: &[Value], _ctx: &mut CallContext) -> Result<Control, Value> {
    match args {
        [] => Err(arity_error("-", "at least 1", 0)),
        [only] => value(Value::Int(0).sub(only)?),
        [first, rest @ ..] => {
            let mut acc = first.clone();
            for v in rest {
                acc = acc.sub(v)?;
            }
            value(acc)
        }
    }
}

fn native_mul(args: &[Value], _ctx: &mut CallContext) -> Result<Control, Value> {
    let mut acc = Value::Int(1);
    for v in args {
        acc = acc.mul(v)?;
    }
    value(acc)
}

fn native_div(args: &[Value], _ctx: &mut CallContext) -> Result<Control, Value> {
    match args {
        [] | [_] => Err(arity_error("/", "at least 2", args.len())),
        [first, rest @ ..] => {
            let mut acc = first.clone();
            for v in rest {
                acc = acc.div(v)?;
            }
            value(acc)
        }
    }
}

fn bool_value(b: bool) -> Value {
    if b { Value::Int(1) } else { Value::nil() }
}

fn native_eq(args: &[Value], _ctx: &mut CallContext) -> Result<Control, Value> {
    if args.len() < 2 {
        return Err(arity_error("=", "at least 2", args.len()));
    }
    let all = args.windows(2).all(|w| w[0].eq_value(&w[1]));
    value(bool_value(all))
}

fn chain(args: &[Value], name: &str, ok: fn(i64) -> bool) -> Result<Control, Value> {
    if args.len() < 2 {
        return Err(arity_error(name, "at least 2", args.len()));
    }
    let holds = args.windows(2).all(|w| ok(w[0].compare(&w[1])));
    value(bool_value(holds))
}

fn native_lt(args: &[Value], _ctx: &mut CallContext) -> Result<Control, Value> {
    chain(args, "<", |c| c < 0)
}

fn native_le(args: &[Value], _ctx: &mut CallContext) -> Result<Control, Value> {
    chain(args, "<=", |c| c <= 0)
}

fn native_gt(args: &[Value], _ctx: &mut CallContext) -> Result<Control, Value> {
    chain(args, ">", |c| c > 0)
}

fn native_ge(args: &[Value], _ctx: &mut CallContext) -> Result<Control, Value> {
    chain(args, ">=", |c| c >= 0)
}

fn native_not(args: &[Value], _ctx: &mut CallContext) -> Result<Control, Value> {
    want("not", args, 1)?;
    value(bool_value(args[0].is_nil()))
}

fn native_first(args: &[Value], _ctx: &mut CallContext) -> Result<Control, Value> {
    want("first", args, 1)?;
    value(args[0].first()?)
}

fn native_rest(args: &[Value], _ctx: &mut CallContext) -> Result<Control, Value> {
    want("rest", args, 1)?;
    value(args[0].rest()?)
}

fn native_cons(args: &[Value], _ctx: &mut CallContext) -> Result<Control, Value> {
    want("cons", args, 2)?;
    value(Value::cons(args[0].clone(), args[1].clone()))
}

fn native_list(args: &[Value], _ctx: &mut CallContext) -> Result<Control, Value> {
    value(Value::list_from(args))
}

fn native_concat(args: &[Value], _ctx: &mut CallContext) -> Result<Control, Value> {
    let mut items = Vec::new();
    for arg in args {
        items.extend(arg.list_items()?);
    }
    value(Value::list_from(&items))
}

fn native_len(args: &[Value], _ctx: &mut CallContext) -> Result<Control, Value> {
    want("len", args, 1)?;
    value(Value::Int(args[0].len()? as i64))
}

/// `get` is attribute access for symbol keys and indexed access
/// otherwise; dicts always treat the key as a value.
fn native_get(args: &[Value], _ctx: &mut CallContext) -> Result<Control, Value> {
    want("get", args, 2)?;
    let target = &args[0];
    let key = &args[1];
    if let Some(obj) = target.as_obj() {
        if let cedar_core::object::Payload::Dict(d) = &obj.payload {
            let found = d.lock().expect("dict poisoned").get(key);
            return value(found.unwrap_or_else(Value::nil));
        }
    }
    if let Some(id) = key.symbol_id() {
        return value(target.getattr(id)?);
    }
    value(target.index(key)?)
}

fn native_setattr(args: &[Value], _ctx: &mut CallContext) -> Result<Control, Value> {
    want("setattr", args, 3)?;
    let Some(id) = args[1].symbol_id() else {
        return Err(type_error("setattr requires a symbol name"));
    };
    args[0].setattr(id, args[2].clone())?;
    value(args[2].clone())
}

fn native_type_of(args: &[Value], _ctx: &mut CallContext) -> Result<Control, Value> {
    want("type-of", args, 1)?;
    value(Value::obj(args[0].type_of()))
}

fn native_apply(args: &[Value], _ctx: &mut CallContext) -> Result<Control, Value> {
    want("apply", args, 2)?;
    let call_args = args[1].list_items()?;
    value(host::host()?.call(&args[0], &call_args)?)
}

fn native_throw(args: &[Value], _ctx: &mut CallContext) -> Result<Control, Value> {
    want("throw", args, 1)?;
    Err(args[0].clone())
}

fn native_require(args: &[Value], _ctx: &mut CallContext) -> Result<Control, Value> {
    want("require", args, 1)?;
    let Some(name) = args[0].as_str() else {
        return Err(type_error("require takes a module name string"));
    };
    value(crate::modules::require(name)?)
}

/// `(go* f)` wraps a zero-argument lambda in a fiber and hands it to a
/// scheduler; returns the fiber.
fn native_go(args: &[Value], _ctx: &mut CallContext) -> Result<Control, Value> {
    want("go*", args, 1)?;
    let Some(l) = args[0].as_obj().and_then(|o| o.as_lambda()) else {
        return Err(type_error("go* requires a lambda"));
    };
    let mut lambda = l.lock().expect("lambda poisoned").copy();
    lambda.isolate_closure();
    lambda.prime_args(&[])?;
    let fiber = new_fiber(lambda)?;
    host::host()?.spawn(fiber.clone());
    value(Value::obj(fiber))
}

fn native_sleep(args: &[Value], _ctx: &mut CallContext) -> Result<Control, Value> {
    want("sleep", args, 1)?;
    let ms = args[0].as_int()?.max(0) as u64;
    Ok(Control::Sleep(ms))
}

fn native_yield(args: &[Value], _ctx: &mut CallContext) -> Result<Control, Value> {
    want("yield", args, 0)?;
    Ok(Control::Yield)
}

fn native_send(args: &[Value], ctx: &mut CallContext) -> Result<Control, Value> {
    want("send", args, 2)?;
    channel::send(&args[0], args[1].clone(), ctx)
}

fn native_recv(args: &[Value], ctx: &mut CallContext) -> Result<Control, Value> {
    want("recv", args, 1)?;
    channel::recv(&args[0], ctx)
}

/// Bind every core native into the core module.
pub fn install() {
    def_global("print", Value::native("print", native_print));
    def_global("println", Value::native("println", native_print));
    def_global("str", Value::native("str", native_str));
    def_global("repr", Value::native("repr", native_repr));

    def_global("+", Value::native("+", native_add));
    def_global("-", Value::native("-", native_sub));
    def_global("*", Value::native("*", native_mul));
    def_global("/", Value::native("/", native_div));

    def_global("=", Value::native("=", native_eq));
    def_global("<", Value::native("<", native_lt));
    def_global("<=", Value::native("<=", native_le));
    def_global(">", Value::native(">", native_gt));
    def_global(">=", Value::native(">=", native_ge));
    def_global("not", Value::native("not", native_not));

    def_global("first", Value::native("first", native_first));
    def_global("rest", Value::native("rest", native_rest));
    def_global("cons", Value::native("cons", native_cons));
    def_global("list", Value::native("list", native_list));
    def_global("concat", Value::native("concat", native_concat));
    def_global("len", Value::native("len", native_len));
    def_global("get", Value::native("get", native_get));
    def_global("setattr", Value::native("setattr", native_setattr));

    def_global("type-of", Value::native("type-of", native_type_of));
    def_global("apply", Value::native("apply", native_apply));
    def_global("throw", Value::native("throw", native_throw));
    def_global("require", Value::native("require", native_require));

    def_global("go*", Value::native("go*", native_go));
    def_global("sleep", Value::native("sleep", native_sleep));
    def_global("yield", Value::native("yield", native_yield));
    def_global("send", Value::native("send", native_send));
    def_global("recv", Value::native("recv", native_recv));
}
