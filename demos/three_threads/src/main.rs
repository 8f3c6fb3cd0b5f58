//! 3つのスレッドを動かすサンプルプログラム
//! kokia で停止・ステップ実行・スレッド生成の追跡を試すために使います。

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

/// 各スレッドが回すカウンタ
fn spin(name: &'static str, counter: Arc<AtomicU64>, rounds: u64) {
    for round in 0..rounds {
        counter.fetch_add(1, Ordering::Relaxed);
        if round % 10 == 0 {
            println!("{}: round {}", name, round);
        }
        thread::sleep(Duration::from_millis(20));
    }
}

fn main() {
    let rounds = std::env::args()
        .nth(1)
        .and_then(|arg| arg.parse().ok())
        .unwrap_or(50);
    println!("pid {}", std::process::id());

    let counter = Arc::new(AtomicU64::new(0));
    let workers: Vec<_> = ["worker-1", "worker-2"]
        .into_iter()
        .map(|name| {
            let counter = Arc::clone(&counter);
            thread::Builder::new()
                .name(name.to_string())
                .spawn(move || spin(name, counter, rounds))
                .expect("failed to spawn worker")
        })
        .collect();

    spin("main", Arc::clone(&counter), rounds);
    for worker in workers {
        worker.join().expect("worker panicked");
    }

    println!("total {}", counter.load(Ordering::Relaxed));
}
