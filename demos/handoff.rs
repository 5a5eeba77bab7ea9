use std::sync::Arc;

use spindle::channel::Rendezvous;
use spindle::future;
use spindle::pool::ThreadPool;

fn main() {
    tracing_subscriber::fmt().with_env_filter(tracing_subscriber::EnvFilter::from_default_env()).init();

    let pool = ThreadPool::builder().parallelism(2).name("handoff").build();
    let channel = Arc::new(Rendezvous::new());
    let (sum, promise) = future::tied::<u64>();

    pool.spawn({
        let channel = channel.clone();
        move || promise.set_value(channel.iter().sum())
    });
    pool.spawn(move || {
        for i in 1..=20 {
            channel.push(i).unwrap();
        }
        channel.close();
    });

    println!("sum.get(): {}", sum.get());
    pool.wait();
}
