//! Fiber, scheduler and channel rendezvous tests.

use cedar_core::Value;

fn eval(src: &str) -> Result<Value, Value> {
    cedar_runtime::init();
    let module = cedar_runtime::new_user_module("concurrency-test");
    cedar_runtime::eval_str(src, &module)
}

fn eval_ok(src: &str) -> Value {
    eval(src).unwrap_or_else(|e| panic!("eval of {src:?} threw: {e}"))
}

#[test]
fn channel_rendezvous_delivers_value() {
    let result = eval_ok(
        "(def ch (chan))
         (go* (fn () (send ch 42)))
         (recv ch)",
    );
    assert_eq!(result, Value::Int(42));
}

#[test]
fn send_completes_against_parked_receiver() {
    // the spawned fiber receives; the main fiber sends after it parked
    let result = eval_ok(
        "(def in (chan))
         (def out (chan))
         (go* (fn () (send out (+ (recv in) 1))))
         (send in 41)
         (recv out)",
    );
    assert_eq!(result, Value::Int(42));
}

#[test]
fn spsc_order_is_preserved() {
    let result = eval_ok(
        "(def ch (chan))
         (defn produce (n)
           (when (<= n 5)
             (send ch n)
             (produce (+ n 1))))
         (go* (fn () (produce 1)))
         (list (recv ch) (recv ch) (recv ch) (recv ch) (recv ch))",
    );
    assert_eq!(
        result,
        Value::list_from(&[
            Value::Int(1),
            Value::Int(2),
            Value::Int(3),
            Value::Int(4),
            Value::Int(5)
        ])
    );
}

#[test]
fn fifo_order_across_fibers() {
    // both senders park before the receiver drains; the earlier fiber's
    // value must come out first
    let result = eval_ok(
        "(def ch (chan))
         (go* (fn () (send ch :first)))
         (go* (fn () (send ch :second)))
         (sleep 50)
         (list (recv ch) (recv ch))",
    );
    assert_eq!(
        result,
        Value::list_from(&[Value::keyword(":first"), Value::keyword(":second")])
    );
}

#[test]
fn many_fibers_rendezvous_once_each() {
    let result = eval_ok(
        "(def ch (chan))
         (defn spawn-senders (n)
           (when (<= n 10)
             (go* (fn () (send ch 1)))
             (spawn-senders (+ n 1))))
         (spawn-senders 1)
         (defn drain (n acc)
           (if (= n 0) acc (drain (- n 1) (+ acc (recv ch)))))
         (drain 10 0)",
    );
    assert_eq!(result, Value::Int(10));
}

#[test]
fn ping_pong_across_two_channels() {
    let result = eval_ok(
        "(def ping (chan))
         (def pong (chan))
         (go* (fn ()
           (send pong (* (recv ping) 2))
           (send pong (* (recv ping) 2))))
         (send ping 10)
         (def a (recv pong))
         (send ping 20)
         (def b (recv pong))
         (list a b)",
    );
    assert_eq!(result, Value::list_from(&[Value::Int(20), Value::Int(40)]));
}

#[test]
fn go_star_returns_a_fiber() {
    let result = eval_ok(
        "(def f (go* (fn () 1)))
         (def t (type-of f))
         (t.name)",
    );
    assert_eq!(result, Value::string("Fiber"));
}

#[test]
fn sleep_yields_at_least_the_requested_time() {
    let start = std::time::Instant::now();
    eval_ok("(sleep 30)");
    assert!(start.elapsed() >= std::time::Duration::from_millis(30));
}

#[test]
fn spawned_fiber_observes_module_globals() {
    let result = eval_ok(
        "(def ch (chan))
         (def base 40)
         (go* (fn () (send ch (+ base 2))))
         (recv ch)",
    );
    assert_eq!(result, Value::Int(42));
}

#[test]
fn channel_capacity_argument_is_accepted() {
    let result = eval_ok(
        "(def ch (chan 4))
         (go* (fn () (send ch :ok)))
         (recv ch)",
    );
    assert_eq!(result, Value::keyword(":ok"));
}

#[test]
fn yield_surrenders_and_resumes() {
    let result = eval_ok(
        "(def ch (chan))
         (go* (fn () (yield) (send ch :done)))
         (recv ch)",
    );
    assert_eq!(result, Value::keyword(":done"));
}

#[test]
fn uncaught_error_in_fiber_does_not_poison_the_scheduler() {
    // the failing fiber dies alone; a later fiber still runs
    let result = eval_ok(
        "(def ch (chan))
         (go* (fn () (throw :die)))
         (sleep 20)
         (go* (fn () (send ch :alive)))
         (recv ch)",
    );
    assert_eq!(result, Value::keyword(":alive"));
}
