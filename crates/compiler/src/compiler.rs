//! Bytecode compiler
//!
//! Walks value trees emitting bytecode into per-lambda chunks. Scope
//! analysis maps symbol ids to closure slots; slots are allocated
//! monotonically across a compilation unit, so nested lambdas address the
//! unit's shared per-call slab and later assignments stay visible through
//! captured slots.

use cedar_core::error::syntax_error;
use cedar_core::host;
use cedar_core::intern::{intern, unintern};
use cedar_core::lambda::{Chunk, Lambda, Op};
use cedar_core::module::module_find;
use cedar_core::object::Payload;
use cedar_core::value::Value;
use std::collections::HashMap;
use std::sync::Arc;

/// Chunk under construction plus a running stack-effect estimate; the
/// declared stack size is the high-water mark with headroom for the
/// calling-convention cells.
struct Emitter {
    chunk: Chunk,
    depth: i32,
    max: i32,
}

impl Emitter {
    fn new() -> Emitter {
        Emitter {
            chunk: Chunk::new(),
            depth: 0,
            max: 0,
        }
    }

    fn op(&mut self, op: Op, effect: i32) {
        self.chunk.emit(op);
        self.note(effect);
    }

    fn note(&mut self, effect: i32) {
        self.depth += effect;
        if self.depth > self.max {
            self.max = self.depth;
        }
    }

    fn finish(mut self) -> Chunk {
        self.chunk.stack_size = self.max.max(0) as u32 + 8;
        self.chunk
    }
}

pub struct Compiler {
    module: Value,
    scopes: Vec<HashMap<u32, u32>>,
    closure_size: u32,
    lambda_depth: u32,
}

/// Compile one top-level form into a unit lambda ending in `EXIT`.
pub fn compile_unit(form: &Value, module: &Value) -> Result<Lambda, Value> {
    let mut c = Compiler {
        module: module.clone(),
        scopes: vec![HashMap::new()],
        closure_size: 0,
        lambda_depth: 0,
    };
    let mut e = Emitter::new();
    e.op(Op::MakeClosure, 0);
    let prelude = e.chunk.len();
    c.compile_object(form, &mut e)?;
    e.op(Op::Exit, -1);
    let mut chunk = e.finish();
    chunk.prelude_end = prelude;

    let mut lambda = Lambda::from_chunk(Arc::new(chunk));
    lambda.closure_size = c.closure_size;
    lambda.module = module.clone();
    lambda.defining = form.clone();
    Ok(lambda)
}

impl Compiler {
    fn find_local(&self, id: u32) -> Option<u32> {
        self.scopes
            .iter()
            .rev()
            .find_map(|scope| scope.get(&id).copied())
    }

    fn bind_local(&mut self, id: u32) -> u32 {
        let slot = self.closure_size;
        self.closure_size += 1;
        self.scopes
            .last_mut()
            .expect("compiler scope stack never empty")
            .insert(id, slot);
        slot
    }

    fn compile_object(&mut self, form: &Value, e: &mut Emitter) -> Result<(), Value> {
        match form {
            Value::Int(n) => {
                e.op(Op::Int, 1);
                e.chunk.emit_i64(*n);
                Ok(())
            }
            Value::Float(f) => {
                e.op(Op::Float, 1);
                e.chunk.emit_f64(*f);
                Ok(())
            }
            Value::Ptr(_) => Err(syntax_error("cannot compile a raw pointer")),
            Value::Obj(None) => {
                e.op(Op::Nil, 1);
                Ok(())
            }
            Value::Obj(Some(obj)) => match &obj.payload {
                Payload::List { .. } => self.compile_list(form, e),
                Payload::Symbol(id) => self.compile_symbol(*id, e),
                Payload::Vector(v) => {
                    // vector literals evaluate their elements
                    let items: Vec<Value> = v.iter().cloned().collect();
                    self.compile_args(&items, e)?;
                    self.compile_symbol(intern("Vector"), e)?;
                    e.op(Op::Call, -1);
                    Ok(())
                }
                _ => {
                    self.compile_constant(form, e);
                    Ok(())
                }
            },
        }
    }

    fn compile_constant(&mut self, form: &Value, e: &mut Emitter) {
        let index = e.chunk.push_const(form.clone());
        e.op(Op::Const, 1);
        e.chunk.emit_u64(index as u64);
    }

    /// Symbols with an interior dot desugar to attribute access:
    /// `a.b` compiles as `(get a (quote b))`, splitting at the last dot.
    fn compile_symbol(&mut self, id: u32, e: &mut Emitter) -> Result<(), Value> {
        let name = unintern(id);
        if name.len() > 1 && name.contains('.') && !name.starts_with('.') && !name.ends_with('.') {
            let (obj, field) = name
                .rsplit_once('.')
                .expect("dot presence checked above");
            let expr = Value::list_from(&[
                Value::symbol("get"),
                Value::symbol(obj),
                Value::list_from(&[Value::symbol("quote"), Value::symbol(field)]),
            ]);
            return self.compile_object(&expr, e);
        }

        if let Some(slot) = self.find_local(id) {
            e.op(Op::LoadLocal, 1);
            e.chunk.emit_u64(slot as u64);
            return Ok(());
        }

        let index = e.chunk.push_const(Value::symbol(&name));
        e.op(Op::LoadGlobal, 1);
        e.chunk.emit_u64(index as u64);
        Ok(())
    }

    /// Arguments compile element-first so `CONS` folds the list up from
    /// the tail: push element, push rest-list, cons.
    fn compile_args(&mut self, items: &[Value], e: &mut Emitter) -> Result<(), Value> {
        match items.split_first() {
            None => {
                e.op(Op::Nil, 1);
                Ok(())
            }
            Some((first, rest)) => {
                self.compile_object(first, e)?;
                self.compile_args(rest, e)?;
                e.op(Op::Cons, -1);
                Ok(())
            }
        }
    }

    fn compile_list(&mut self, form: &Value, e: &mut Emitter) -> Result<(), Value> {
        let head = form.first()?;
        let rest = form.rest()?;

        if let Some(id) = head.symbol_id() {
            match unintern(id).as_str() {
                "def" => return self.compile_def(&rest, e),
                "quote" => {
                    self.compile_constant(&rest.first()?, e);
                    return Ok(());
                }
                "quasiquote" => {
                    let expanded = quasiquote(&rest.first()?)?;
                    return self.compile_object(&expanded, e);
                }
                "fn" | "lambda" => return self.compile_lambda(None, &rest, e),
                "if" => return self.compile_if(&rest, e),
                "do" | "progn" => return self.compile_progn(&rest, e),
                "try" => return self.compile_try(&rest, e),
                "defmacro" => return self.compile_defmacro(form, &rest, e),
                "class" => {
                    let name = rest.first()?;
                    if name.symbol_id().is_none() {
                        return Err(syntax_error(format!(
                            "class requires a symbol name: {form}"
                        )));
                    }
                    let expr = Value::list_from(&[
                        Value::symbol("def"),
                        name.clone(),
                        Value::list_from(&[
                            Value::symbol("Type"),
                            Value::string(name.to_human_string()),
                        ]),
                    ]);
                    return self.compile_object(&expr, e);
                }
                _ => {}
            }

            // macro call: the head resolves in the current module to a
            // lambda flagged as a macro; expand with the raw argument
            // forms and compile the result
            if self.find_local(id).is_none() {
                if let Some(binding) = module_find(&self.module, id, &self.module) {
                    if let Some(l) = binding.as_obj().and_then(|o| o.as_lambda()) {
                        let is_macro = l.lock().expect("lambda poisoned").is_macro;
                        if is_macro {
                            let args = rest.list_items()?;
                            let expanded = host::host()?.call(&binding, &args)?;
                            return self.compile_object(&expanded, e);
                        }
                    }
                }
            }
        }

        let args = rest.list_items()?;
        self.compile_args(&args, e)?;
        self.compile_object(&head, e)?;
        e.op(Op::Call, -1);
        Ok(())
    }

    /// `def` assigns an existing local slot when the name is in scope,
    /// otherwise binds in the module. Either way the value stays on the
    /// stack as the form's result.
    fn compile_def(&mut self, rest: &Value, e: &mut Emitter) -> Result<(), Value> {
        let name = rest.first()?;
        let Some(id) = name.symbol_id() else {
            return Err(syntax_error(format!(
                "def requires a symbol name, given {name}"
            )));
        };
        let value_form = rest.rest()?.first()?;

        // (def f (fn …)) names the lambda for diagnostics
        let mut named = false;
        if value_form.is_list() {
            if let Some(head) = value_form.first()?.symbol_id() {
                let head_name = unintern(head);
                if head_name == "fn" || head_name == "lambda" {
                    self.compile_lambda(Some(name.clone()), &value_form.rest()?, e)?;
                    named = true;
                }
            }
        }
        if !named {
            self.compile_object(&value_form, e)?;
        }

        if let Some(slot) = self.find_local(id) {
            e.op(Op::SetLocal, 0);
            e.chunk.emit_u64(slot as u64);
        } else {
            let index = e.chunk.push_const(name);
            e.op(Op::SetGlobal, 0);
            e.chunk.emit_u64(index as u64);
        }
        Ok(())
    }

    fn compile_progn(&mut self, forms: &Value, e: &mut Emitter) -> Result<(), Value> {
        if forms.is_nil() {
            e.op(Op::Nil, 1);
            return Ok(());
        }
        let mut walk = forms.clone();
        loop {
            self.compile_object(&walk.first()?, e)?;
            walk = walk.rest()?;
            if walk.is_nil() {
                return Ok(());
            }
            e.op(Op::Skip, -1);
        }
    }

    fn compile_if(&mut self, rest: &Value, e: &mut Emitter) -> Result<(), Value> {
        let cond = rest.first()?;
        let then_branch = rest.rest()?.first()?;
        let tail = rest.rest()?.rest()?;

        self.compile_object(&cond, e)?;
        e.op(Op::JmpIfFalse, -1);
        let to_else = e.chunk.len();
        e.chunk.emit_i32(0);

        self.compile_object(&then_branch, e)?;
        e.op(Op::Jmp, 0);
        let to_end = e.chunk.len();
        e.chunk.emit_i32(0);
        // both arms leave one value; count it once
        e.note(-1);

        let else_at = e.chunk.len();
        e.chunk.patch_i32(to_else, (else_at - (to_else + 4)) as i32);
        if tail.is_nil() {
            e.op(Op::Nil, 1);
        } else {
            self.compile_object(&tail.first()?, e)?;
        }

        let end_at = e.chunk.len();
        e.chunk.patch_i32(to_end, (end_at - (to_end + 4)) as i32);
        Ok(())
    }

    /// `(try body… (catch err handler…))`
    fn compile_try(&mut self, rest: &Value, e: &mut Emitter) -> Result<(), Value> {
        let items = rest.list_items()?;
        let Some((catch_form, body)) = items.split_last() else {
            return Err(syntax_error("try requires a (catch …) clause"));
        };
        let catch_items = catch_form.list_items().map_err(|_| {
            syntax_error("try requires a (catch name handler…) clause as its final form")
        })?;
        if catch_items.first().and_then(|h| h.symbol_id()) != Some(intern("catch")) {
            return Err(syntax_error(
                "try requires a (catch name handler…) clause as its final form",
            ));
        }
        let Some(err_name) = catch_items.get(1).and_then(|n| n.symbol_id()) else {
            return Err(syntax_error("catch requires a symbol to bind"));
        };
        let handler_forms = Value::list_from(&catch_items[2..]);

        let slot = self.bind_local(err_name);

        e.op(Op::PushHandler, 0);
        let off_at = e.chunk.len();
        e.chunk.emit_i32(0);
        e.chunk.emit_u64(slot as u64);

        self.compile_progn(&Value::list_from(body), e)?;
        e.op(Op::PopHandler, 0);
        e.op(Op::Jmp, 0);
        let end_at = e.chunk.len();
        e.chunk.emit_i32(0);
        // the two paths produce one value between them
        e.note(-1);

        let catch_target = e.chunk.len();
        e.chunk
            .patch_i32(off_at, (catch_target - (off_at + 12)) as i32);
        self.compile_progn(&handler_forms, e)?;

        let end_target = e.chunk.len();
        e.chunk
            .patch_i32(end_at, (end_target - (end_at + 4)) as i32);

        // the error binding is scoped to this form
        self.scopes
            .last_mut()
            .expect("compiler scope stack never empty")
            .remove(&err_name);
        Ok(())
    }

    fn compile_lambda(
        &mut self,
        name: Option<Value>,
        rest: &Value,
        e: &mut Emitter,
    ) -> Result<(), Value> {
        self.lambda_depth += 1;
        let result = self.compile_lambda_inner(name, rest, e);
        self.lambda_depth -= 1;
        result
    }

    fn compile_lambda_inner(
        &mut self,
        name: Option<Value>,
        rest: &Value,
        e: &mut Emitter,
    ) -> Result<(), Value> {
        let params = rest.first()?;
        let body = rest.rest()?;

        self.scopes.push(HashMap::new());
        let mut sub = Emitter::new();
        // a fresh slab per call at the outermost lambda level; nested
        // lambdas share the enclosing slab so captures stay live
        if self.lambda_depth == 1 {
            sub.op(Op::MakeClosure, 0);
        }

        let arg_index = self.closure_size;
        let mut argc = 0u32;
        let mut vararg = false;

        let mut walk = params.clone();
        loop {
            if walk.is_nil() {
                break;
            }
            if let Some(id) = walk.symbol_id() {
                // dotted tail: the rest of the argument list in one slot
                let slot = self.bind_local(id);
                sub.op(Op::ArgPop, 0);
                sub.chunk.emit_u64(slot as u64);
                argc += 1;
                vararg = true;
                break;
            }
            if !walk.is_list() {
                self.scopes.pop();
                return Err(syntax_error(format!(
                    "lambda arguments must be symbols: {params}"
                )));
            }
            let param = walk.first()?;
            let Some(id) = param.symbol_id() else {
                self.scopes.pop();
                return Err(syntax_error(format!(
                    "lambda arguments must be symbols: {params}"
                )));
            };
            let slot = self.bind_local(id);
            sub.op(Op::ArgPop, 0);
            sub.chunk.emit_u64(slot as u64);
            argc += 1;
            walk = walk.rest()?;
        }

        let prelude = sub.chunk.len();
        let body_result = self.compile_progn(&body, &mut sub);
        self.scopes.pop();
        body_result?;
        sub.op(Op::Return, -1);

        let mut chunk = sub.finish();
        chunk.prelude_end = prelude;

        let mut template = Lambda::from_chunk(Arc::new(chunk));
        template.arg_index = arg_index;
        template.argc = argc;
        template.vararg = vararg;
        template.module = self.module.clone();
        template.defining = rest.clone();
        if let Some(n) = name {
            template.name = n;
        }

        let index = e.chunk.push_const(Value::lambda(template));
        e.op(Op::MakeFunc, 1);
        e.chunk.emit_u64(index as u64);
        Ok(())
    }

    /// `(defmacro name params body…)` compiles the function immediately,
    /// evaluates it on a nested fiber, flags it and binds it so later
    /// forms in the same source can expand through it.
    fn compile_defmacro(
        &mut self,
        form: &Value,
        rest: &Value,
        e: &mut Emitter,
    ) -> Result<(), Value> {
        let name = rest.first()?;
        let Some(id) = name.symbol_id() else {
            return Err(syntax_error(format!(
                "defmacro requires a symbol name: {form}"
            )));
        };
        let params = rest.rest()?.first()?;
        let body = rest.rest()?.rest()?;

        let fn_form = Value::cons(Value::symbol("fn"), Value::cons(params, body));
        let unit = compile_unit(&fn_form, &self.module)?;
        let mut primed = unit;
        primed.prime_args(&[])?;
        let lambda_value = host::host()?.call(&Value::lambda(primed), &[])?;

        match lambda_value.as_obj().and_then(|o| o.as_lambda()) {
            Some(l) => {
                let mut l = l.lock().expect("lambda poisoned");
                l.is_macro = true;
                l.name = name.clone();
                l.module = self.module.clone();
            }
            None => {
                return Err(syntax_error(format!(
                    "defmacro body did not produce a lambda: {form}"
                )));
            }
        }

        let target = if self.module.is_nil() {
            cedar_core::module::core_module()
        } else {
            self.module.clone()
        };
        target
            .as_obj()
            .and_then(|o| o.as_module())
            .expect("defmacro target is a module")
            .def(id, lambda_value);

        e.op(Op::Nil, 1);
        Ok(())
    }
}

/// Expand a quasiquote template into `list`/`concat` calls. `unquote`
/// substitutes a single expression, `unquote-splicing` splices a list
/// segment. Atoms and vectors quote/rebuild literally.
pub fn quasiquote(form: &Value) -> Result<Value, Value> {
    if form.is_list() {
        let head = form.first()?;
        if head.symbol_id() == Some(intern("unquote")) {
            return form.rest()?.first();
        }

        let mut segments = vec![Value::symbol("concat")];
        let mut walk = form.clone();
        while !walk.is_nil() {
            if !walk.is_list() {
                return Err(syntax_error(
                    "dotted lists are not supported inside quasiquote",
                ));
            }
            let item = walk.first()?;
            let splice = item.is_list()
                && item.first()?.symbol_id() == Some(intern("unquote-splicing"));
            if splice {
                segments.push(item.rest()?.first()?);
            } else {
                segments.push(Value::list_from(&[Value::symbol("list"), quasiquote(&item)?]));
            }
            walk = walk.rest()?;
        }
        return Ok(Value::list_from(&segments));
    }

    if let Some(obj) = form.as_obj() {
        if let Payload::Vector(v) = &obj.payload {
            let mut items = vec![Value::symbol("Vector")];
            for item in v.iter() {
                items.push(quasiquote(item)?);
            }
            return Ok(Value::list_from(&items));
        }
    }

    Ok(Value::list_from(&[Value::symbol("quote"), form.clone()]))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reader::read_one;
    use cedar_core::lambda::Code;

    fn unit(src: &str) -> Lambda {
        let form = read_one(src).unwrap();
        compile_unit(&form, &Value::nil()).unwrap()
    }

    fn ops_of(chunk: &Chunk) -> Vec<Op> {
        let mut ops = Vec::new();
        let mut at = 0;
        while at < chunk.len() {
            let op = Op::from_u8(chunk.code[at]).unwrap();
            ops.push(op);
            at += 1;
            at += match op {
                Op::Const
                | Op::Int
                | Op::Float
                | Op::LoadLocal
                | Op::SetLocal
                | Op::LoadGlobal
                | Op::SetGlobal
                | Op::MakeFunc
                | Op::ArgPop => 8,
                Op::Jmp | Op::JmpIfFalse => 4,
                Op::PushHandler => 12,
                _ => 0,
            };
        }
        ops
    }

    #[test]
    fn integer_literal_compiles_to_int_op() {
        let l = unit("42");
        let chunk = l.chunk().unwrap();
        assert_eq!(
            ops_of(chunk),
            vec![Op::MakeClosure, Op::Int, Op::Exit]
        );
        assert_eq!(chunk.read_i64(2), Some(42));
    }

    #[test]
    fn call_builds_arg_list_with_cons() {
        let l = unit("(f 1 2)");
        let chunk = l.chunk().unwrap();
        assert_eq!(
            ops_of(chunk),
            vec![
                Op::MakeClosure,
                Op::Int,
                Op::Int,
                Op::Nil,
                Op::Cons,
                Op::Cons,
                Op::LoadGlobal,
                Op::Call,
                Op::Exit
            ]
        );
    }

    #[test]
    fn def_at_top_level_is_global() {
        let l = unit("(def x 1)");
        let chunk = l.chunk().unwrap();
        assert!(ops_of(chunk).contains(&Op::SetGlobal));
    }

    #[test]
    fn lambda_args_become_arg_pops() {
        let l = unit("(fn (a b) a)");
        let chunk = l.chunk().unwrap();
        // the template constant holds the inner chunk
        let template = chunk
            .consts
            .iter()
            .find_map(|c| c.as_obj().and_then(|o| o.as_lambda()))
            .expect("template constant");
        let inner = template.lock().unwrap();
        assert_eq!(inner.argc, 2);
        assert!(!inner.vararg);
        let Code::Chunk(ic) = &inner.code else {
            panic!("bytecode template")
        };
        let ops = ops_of(ic);
        assert_eq!(
            &ops[..3],
            &[Op::MakeClosure, Op::ArgPop, Op::ArgPop]
        );
        assert_eq!(ic.prelude_end, 1 + 9 + 9);
        assert_eq!(ops.last(), Some(&Op::Return));
    }

    #[test]
    fn dotted_params_mark_vararg() {
        let l = unit("(fn (a . rest) rest)");
        let chunk = l.chunk().unwrap();
        let template = chunk
            .consts
            .iter()
            .find_map(|c| c.as_obj().and_then(|o| o.as_lambda()))
            .expect("template constant");
        let inner = template.lock().unwrap();
        assert_eq!(inner.argc, 2);
        assert!(inner.vararg);
    }

    #[test]
    fn if_emits_conditional_jumps() {
        let l = unit("(if 1 2 3)");
        let ops = ops_of(l.chunk().unwrap());
        assert!(ops.contains(&Op::JmpIfFalse));
        assert!(ops.contains(&Op::Jmp));
    }

    #[test]
    fn progn_skips_intermediate_results() {
        let l = unit("(do 1 2 3)");
        let ops = ops_of(l.chunk().unwrap());
        assert_eq!(ops.iter().filter(|&&o| o == Op::Skip).count(), 2);
    }

    #[test]
    fn try_installs_handler() {
        let l = unit("(try 1 (catch e 2))");
        let ops = ops_of(l.chunk().unwrap());
        assert!(ops.contains(&Op::PushHandler));
        assert!(ops.contains(&Op::PopHandler));
    }

    #[test]
    fn dot_symbol_desugars_to_get() {
        let l = unit("a.b");
        let chunk = l.chunk().unwrap();
        assert!(
            chunk
                .consts
                .iter()
                .any(|c| c.symbol_id() == Some(intern("get")))
        );
    }

    #[test]
    fn quote_compiles_to_constant() {
        let l = unit("'(1 2)");
        let chunk = l.chunk().unwrap();
        assert_eq!(ops_of(chunk), vec![Op::MakeClosure, Op::Const, Op::Exit]);
        assert_eq!(
            chunk.consts[0],
            Value::list_from(&[Value::Int(1), Value::Int(2)])
        );
    }

    #[test]
    fn quasiquote_expansion_shape() {
        let form = read_one("`(a ,b ,@c)").unwrap();
        let template = form.rest().unwrap().first().unwrap();
        let expanded = quasiquote(&template).unwrap();
        let text = expanded.to_repr_string();
        assert_eq!(text, "(concat (list (quote a)) (list b) c)");
    }

    #[test]
    fn unbound_scope_stays_global() {
        let l = unit("(fn (x) y)");
        let chunk = l.chunk().unwrap();
        let template = chunk
            .consts
            .iter()
            .find_map(|c| c.as_obj().and_then(|o| o.as_lambda()))
            .expect("template constant");
        let inner = template.lock().unwrap();
        let Code::Chunk(ic) = &inner.code else {
            panic!("bytecode template")
        };
        assert!(ops_of(ic).contains(&Op::LoadGlobal));
    }

    #[test]
    fn class_desugars_to_type_construction() {
        let l = unit("(class Foo)");
        let chunk = l.chunk().unwrap();
        assert!(
            chunk
                .consts
                .iter()
                .any(|c| c.symbol_id() == Some(intern("Type")))
        );
        assert!(ops_of(chunk).contains(&Op::SetGlobal));
    }
}
