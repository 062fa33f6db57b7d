use costack::{Scheduler, State};

fn main() {
    let mut sch = Scheduler::new();

    let ping = sch.spawn(|sch| {
        for i in 0..3 {
            println!("ping {}", i);
            sch.yield_now();
        }
    });

    let pong = sch.spawn(|sch| {
        for i in 0..3 {
            println!("pong {}", i);
            sch.yield_now();
        }
    });

    while sch.state(ping) != State::Dead || sch.state(pong) != State::Dead {
        sch.resume(ping).unwrap();
        sch.resume(pong).unwrap();
    }

    println!("all done, {} coroutine(s) left", sch.count());
}
