//! End-to-end evaluation tests: source text through the reader, compiler
//! and VM.

use cedar_core::Value;

fn eval(src: &str) -> Result<Value, Value> {
    cedar_runtime::init();
    let module = cedar_runtime::new_user_module("eval-test");
    cedar_runtime::eval_str(src, &module)
}

fn eval_ok(src: &str) -> Value {
    eval(src).unwrap_or_else(|e| panic!("eval of {src:?} threw: {e}"))
}

fn eval_err(src: &str) -> Value {
    eval(src).expect_err("expected a thrown value")
}

#[test]
fn arithmetic_folds() {
    assert_eq!(eval_ok("(+ 1 2 3)"), Value::Int(6));
    assert_eq!(eval_ok("(- 10 4 1)"), Value::Int(5));
    assert_eq!(eval_ok("(* 2 3 4)"), Value::Int(24));
    assert_eq!(eval_ok("(/ 12 3 2)"), Value::Int(2));
    assert_eq!(eval_ok("(- 5)"), Value::Int(-5));
}

#[test]
fn arithmetic_promotes_to_float() {
    assert_eq!(eval_ok("(+ 1 0.5)"), Value::Float(1.5));
    assert_eq!(eval_ok("(* 2 1.5)"), Value::Float(3.0));
}

#[test]
fn division_by_zero_throws() {
    let err = eval_err("(/ 1 0)");
    assert!(err.to_human_string().contains("arithmetic-error"));
}

#[test]
fn immediate_lambda_call() {
    assert_eq!(eval_ok("((fn (x) (* x x)) 7)"), Value::Int(49));
}

#[test]
fn lambda_arity_is_checked() {
    let err = eval_err("((fn (x) x))");
    assert!(err.to_human_string().contains("arity-error"));
    let err = eval_err("((fn (x) x) 1 2)");
    assert!(err.to_human_string().contains("arity-error"));
}

#[test]
fn vararg_collects_rest() {
    assert_eq!(
        eval_ok("((fn (a . rest) rest) 1 2 3)"),
        Value::list_from(&[Value::Int(2), Value::Int(3)])
    );
    assert!(eval_ok("((fn (a . rest) rest) 1)").is_nil());
    assert_eq!(eval_ok("((fn (a . rest) a) 1 2)"), Value::Int(1));
}

#[test]
fn closures_capture_by_reference() {
    let result = eval_ok(
        "(def mk (fn (n) (fn () (def n (+ n 1)) n)))
         (def c (mk 10))
         (c) (c) (c)",
    );
    assert_eq!(result, Value::Int(13));
}

#[test]
fn separate_closures_do_not_share() {
    let result = eval_ok(
        "(def mk (fn (n) (fn () (def n (+ n 1)) n)))
         (def a (mk 10))
         (def b (mk 100))
         (a) (a)
         (b)",
    );
    assert_eq!(result, Value::Int(101));
}

#[test]
fn if_branches_on_nil() {
    assert_eq!(eval_ok("(if 1 2 3)"), Value::Int(2));
    assert_eq!(eval_ok("(if nil 2 3)"), Value::Int(3));
    assert!(eval_ok("(if nil 2)").is_nil());
    // zero is not nil, so it is true
    assert_eq!(eval_ok("(if 0 2 3)"), Value::Int(2));
}

#[test]
fn do_returns_last() {
    assert_eq!(eval_ok("(do 1 2 3)"), Value::Int(3));
}

#[test]
fn def_returns_and_binds() {
    assert_eq!(eval_ok("(def x 5) (+ x 1)"), Value::Int(6));
    assert_eq!(eval_ok("(def y 9)"), Value::Int(9));
}

#[test]
fn unbound_symbol_throws() {
    let err = eval_err("definitely-not-bound");
    assert!(err.to_human_string().contains("unbound-error"));
}

#[test]
fn quote_and_lists() {
    assert_eq!(
        eval_ok("'(1 2 3)"),
        Value::list_from(&[Value::Int(1), Value::Int(2), Value::Int(3)])
    );
    assert_eq!(
        eval_ok("(cons 1 (cons 2 nil))"),
        Value::list_from(&[Value::Int(1), Value::Int(2)])
    );
    assert_eq!(eval_ok("(first '(1 2))"), Value::Int(1));
    assert_eq!(eval_ok("(rest '(1 2))"), Value::list_from(&[Value::Int(2)]));
    assert_eq!(eval_ok("(len '(1 2 3))"), Value::Int(3));
}

#[test]
fn comparisons_return_truthy_or_nil() {
    assert_eq!(eval_ok("(= 2 2)"), Value::Int(1));
    assert!(eval_ok("(= 2 3)").is_nil());
    assert_eq!(eval_ok("(< 1 2 3)"), Value::Int(1));
    assert!(eval_ok("(< 1 3 2)").is_nil());
    assert_eq!(eval_ok("(>= 3 3 2)"), Value::Int(1));
    assert_eq!(eval_ok("(not nil)"), Value::Int(1));
    assert!(eval_ok("(not 5)").is_nil());
}

#[test]
fn strings_are_char_sequences() {
    assert_eq!(eval_ok("(first \"abc\")"), Value::string("a"));
    assert_eq!(eval_ok("(rest \"abc\")"), Value::string("bc"));
    assert_eq!(eval_ok("(len \"abc\")"), Value::Int(3));
    assert_eq!(eval_ok("(get \"abc\" 1)"), Value::string("b"));
    assert!(eval_ok("(first \"\")").is_nil());
}

#[test]
fn string_index_out_of_range_throws() {
    let err = eval_err("(get \"abc\" 9)");
    assert!(err.to_human_string().contains("index-error"));
}

#[test]
fn vector_literals_and_immutability() {
    let v = eval_ok("[1 2 3]");
    assert_eq!(v.len().unwrap(), 3);

    let result = eval_ok(
        "(def v [1 2 3])
         (def v2 (v.set 1 9))
         (list (v.get 1) (v2.get 1) (v.get 0) (v2.get 0))",
    );
    assert_eq!(
        result,
        Value::list_from(&[Value::Int(2), Value::Int(9), Value::Int(1), Value::Int(1)])
    );
}

#[test]
fn vector_push_pop_peek() {
    assert_eq!(
        eval_ok("(def v [1 2]) (def v2 (v.put 3)) (v2.peek)"),
        Value::Int(3)
    );
    assert_eq!(eval_ok("(def v [1 2 3]) (len (v.pop))"), Value::Int(2));
    assert_eq!(eval_ok("(def v [1 2 3]) (v.first)"), Value::Int(1));
    assert_eq!(eval_ok("(first [4 5])"), Value::Int(4));
}

#[test]
fn vector_literal_evaluates_elements() {
    let v = eval_ok("[(+ 1 1) (* 2 3)]");
    assert_eq!(v.index(&Value::Int(0)).unwrap(), Value::Int(2));
    assert_eq!(v.index(&Value::Int(1)).unwrap(), Value::Int(6));
}

#[test]
fn dict_literals() {
    assert_eq!(eval_ok("(get {:a 1 :b 2} :b)"), Value::Int(2));
    assert!(eval_ok("(get {:a 1} :missing)").is_nil());
    assert_eq!(eval_ok("(len {:a 1 :b 2})"), Value::Int(2));
}

#[test]
fn dict_set_mutates() {
    assert_eq!(
        eval_ok("(def d {:a 1}) (d.set :b 2) (get d :b)"),
        Value::Int(2)
    );
}

#[test]
fn dot_access_desugars_to_get() {
    assert_eq!(eval_ok("(def d {:k 7}) (d.get :k)"), Value::Int(7));
}

#[test]
fn try_catch_intercepts_thrown_values() {
    assert_eq!(
        eval_ok("(try (throw \"boom\") (catch e e))"),
        Value::string("boom")
    );
    // the body value flows through when nothing throws
    assert_eq!(eval_ok("(try 42 (catch e 0))"), Value::Int(42));
    // thrown values from deeper frames unwind to the handler
    assert_eq!(
        eval_ok("(def f (fn () (throw 7))) (try (f) (catch e (+ e 1)))"),
        Value::Int(8)
    );
}

#[test]
fn try_catch_catches_runtime_errors() {
    let caught = eval_ok("(try (/ 1 0) (catch e e))");
    assert!(caught.to_human_string().contains("arithmetic-error"));
    let caught = eval_ok("(try missing-symbol (catch e e))");
    assert!(caught.to_human_string().contains("unbound-error"));
}

#[test]
fn uncaught_throw_terminates_evaluation() {
    let err = eval_err("(throw :bang)");
    assert_eq!(err, Value::keyword(":bang"));
}

#[test]
fn apply_spreads_arguments() {
    assert_eq!(eval_ok("(apply + (list 1 2 3))"), Value::Int(6));
    assert_eq!(eval_ok("(apply (fn (a b) (* a b)) '(6 7))"), Value::Int(42));
}

#[test]
fn defmacro_and_quasiquote() {
    assert_eq!(
        eval_ok(
            "(defmacro twice (form) `(+ ,form ,form))
             (twice 21)"
        ),
        Value::Int(42)
    );
}

#[test]
fn quasiquote_splicing() {
    assert_eq!(
        eval_ok("`(1 ,(+ 1 1) ,@(list 3 4))"),
        Value::list_from(&[
            Value::Int(1),
            Value::Int(2),
            Value::Int(3),
            Value::Int(4)
        ])
    );
}

#[test]
fn prelude_is_available() {
    assert_eq!(eval_ok("(inc 41)"), Value::Int(42));
    assert_eq!(eval_ok("(dec 1)"), Value::Int(0));
    assert_eq!(eval_ok("(second '(1 2 3))"), Value::Int(2));
    assert_eq!(eval_ok("true"), Value::Int(1));
    assert!(eval_ok("false").is_nil());
    assert_eq!(eval_ok("(when 1 :yes)"), Value::keyword(":yes"));
    assert!(eval_ok("(when nil :yes)").is_nil());
    assert_eq!(eval_ok("(unless nil :no)"), Value::keyword(":no"));
}

#[test]
fn prelude_defn_defines_functions() {
    assert_eq!(
        eval_ok("(defn square (x) (* x x)) (square 9)"),
        Value::Int(81)
    );
}

#[test]
fn prelude_sequence_helpers() {
    assert_eq!(
        eval_ok("(map inc '(1 2 3))"),
        Value::list_from(&[Value::Int(2), Value::Int(3), Value::Int(4)])
    );
    assert_eq!(
        eval_ok("(filter pos? '(-1 2 -3 4))"),
        Value::list_from(&[Value::Int(2), Value::Int(4)])
    );
    assert_eq!(eval_ok("(reduce + 0 '(1 2 3 4))"), Value::Int(10));
    assert_eq!(
        eval_ok("(reverse '(1 2 3))"),
        Value::list_from(&[Value::Int(3), Value::Int(2), Value::Int(1)])
    );
}

#[test]
fn backslash_lambda_shorthand() {
    assert_eq!(eval_ok(r"(map \x (* x 10) '(1 2))"), {
        Value::list_from(&[Value::Int(10), Value::Int(20)])
    });
}

#[test]
fn recursion_terminates() {
    assert_eq!(
        eval_ok(
            "(defn fact (n) (if (= n 0) 1 (* n (fact (- n 1)))))
             (fact 10)"
        ),
        Value::Int(3628800)
    );
}

#[test]
fn str_builds_strings() {
    assert_eq!(eval_ok("(str \"a\" 1 :k)"), Value::string("a1:k"));
}

#[test]
fn type_of_returns_type_objects() {
    assert_eq!(
        eval_ok("(def t (type-of 1)) (t.name)"),
        Value::string("Number")
    );
    assert_eq!(
        eval_ok("(def t (type-of \"s\")) (t.name)"),
        Value::string("String")
    );
    assert_eq!(
        eval_ok("(def t (type-of '(1))) (t.name)"),
        Value::string("List")
    );
    assert_eq!(
        eval_ok("(def t (type-of nil)) (t.name)"),
        Value::string("Nil")
    );
}

#[test]
fn class_definition_and_dispatch_override() {
    let result = eval_ok(
        "(class Foo)
         (Foo.set-field 'greet (fn (self) \"foo\"))
         (class Bar)
         (Bar.add-parent Foo)
         ((Bar.get-field 'greet) (Bar))",
    );
    assert_eq!(result, Value::string("foo"));
}

#[test]
fn method_dispatch_through_instances() {
    let result = eval_ok(
        "(class Point)
         (Point.set-field 'new (fn (self x y)
           (setattr self 'x x)
           (setattr self 'y y)))
         (Point.set-field 'sum (fn (self) (+ (get self 'x) (get self 'y))))
         (def p (Point 3 4))
         (p.sum)",
    );
    assert_eq!(result, Value::Int(7));
}

#[test]
fn earlier_parent_wins_dispatch() {
    let result = eval_ok(
        "(class A)
         (A.set-field 'which (fn (self) :a))
         (class B)
         (B.set-field 'which (fn (self) :b))
         (class C)
         (C.add-parent A)
         (C.add-parent B)
         (def c (C))
         (c.which)",
    );
    assert_eq!(result, Value::keyword(":a"));
}

#[test]
fn operator_overloading_dispatches_on_left_operand() {
    let result = eval_ok(
        "(class Money)
         (Money.set-field 'new (fn (self amount) (setattr self 'amount amount)))
         (Money.set-field '+ (fn (self other)
           (Money (+ (get self 'amount) other))))
         (def m (+ (Money 10) 5))
         (get m 'amount)",
    );
    assert_eq!(result, Value::Int(15));
}

#[test]
fn instance_attributes_are_per_object() {
    let result = eval_ok(
        "(class Box)
         (def a (Box))
         (def b (Box))
         (setattr a 'v 1)
         (setattr b 'v 2)
         (list (get a 'v) (get b 'v))",
    );
    assert_eq!(result, Value::list_from(&[Value::Int(1), Value::Int(2)]));
}

#[test]
fn synthetic_class_attribute() {
    assert_eq!(
        eval_ok("(def t (get 5 '__class__)) (t.name)"),
        Value::string("Number")
    );
}

#[test]
fn hex_and_octal_literals() {
    assert_eq!(eval_ok("0x10"), Value::Int(16));
    assert_eq!(eval_ok("0o10"), Value::Int(8));
}

#[test]
fn dotted_pair_in_source() {
    let pair = eval_ok("'(1 . 2)");
    assert_eq!(pair.first().unwrap(), Value::Int(1));
    assert_eq!(pair.rest().unwrap(), Value::Int(2));
}

#[test]
fn empty_source_is_nil() {
    assert!(eval_ok("").is_nil());
    assert!(eval_ok("; only a comment").is_nil());
}

#[test]
fn reader_errors_become_thrown_values() {
    let err = eval_err("(1 2");
    assert!(err.to_human_string().contains("syntax-error"));
}
