use std::sync::Arc;

use spindle::fiber;
use spindle::sync::SpinLock;

#[spindle::main(parallelism = 1)]
fn main() {
    let steps = Arc::new(SpinLock::new(Vec::new()));
    let ping = fiber::spawn({
        let steps = steps.clone();
        move || {
            for _ in 0..5 {
                steps.lock().push("ping");
                fiber::yield_now();
            }
        }
    });
    let pong = fiber::spawn({
        let steps = steps.clone();
        move || {
            for _ in 0..5 {
                steps.lock().push("pong");
                fiber::yield_now();
            }
        }
    });
    ping.join().unwrap();
    pong.join().unwrap();
    println!("steps: {:?}", *steps.lock());
}
