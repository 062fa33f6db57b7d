use costack::Scheduler;

fn main() {
    let mut sch = Scheduler::new();

    // Spawn a new coroutine
    let id = sch.spawn(move |sch| {
        println!("1. Hello in coroutine!");

        // Yield back to the main context
        sch.yield_now();

        println!("3. We are back!!");
    });

    // Resume it for the first time
    sch.resume(id).unwrap();

    println!("2. We are here!");

    // Resume the coroutine
    sch.resume(id).unwrap();

    println!("4. Back to main.");
}
