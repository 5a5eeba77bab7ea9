// Kept alone in its own binary, as process cpu time counts every thread of the process.

use std::thread;
use std::time::Duration;

use more_asserts::assert_lt;
use pretty_assertions::assert_eq;
use spindle::future;
use spindle::pool::ThreadPool;

fn process_cpu_time() -> Duration {
    let mut ts = libc::timespec { tv_sec: 0, tv_nsec: 0 };
    let rc = unsafe { libc::clock_gettime(libc::CLOCK_PROCESS_CPUTIME_ID, &mut ts) };
    assert_eq!(rc, 0);
    Duration::new(ts.tv_sec as u64, ts.tv_nsec as u32)
}

#[test]
fn test_waiting_fibers_burn_no_cpu() {
    let pool = ThreadPool::new(2);
    let (future, promise) = future::tied::<usize>();
    let getter = pool.spawn(move || future.get());
    let joiner = pool.spawn(move || getter.join().unwrap() * 2);
    pool.wait();
    let start = process_cpu_time();
    thread::sleep(Duration::from_millis(500));
    let burned = process_cpu_time() - start;
    promise.set_value(7);
    assert_eq!(joiner.join().unwrap(), 14);
    assert_lt!(burned, Duration::from_millis(100));
}
