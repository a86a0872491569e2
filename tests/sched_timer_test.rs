// Scheduler scenarios: minute cadence, re-arming, time adjustment.

use things_shell::imdb::{Imdb, ImdbDef};
use things_shell::lsh::Shell;
use things_shell::platform::sim::{SimClock, SimRng, SimTimer};
use things_shell::platform::Timer;
use things_shell::sched::SchedCore;
use things_shell::svcs::Runtime;

const BASE_UNIX: u32 = 1_700_000_000; // 22:13:20 UTC, second 20 of the minute

fn runtime() -> Runtime {
    let mut rt = Runtime::new(
        Imdb::init(ImdbDef { block_size: 1024 }),
        Box::new(SimClock::new(BASE_UNIX)),
        Box::new(SimRng::new(1)),
    );
    let shell = Shell::start(&mut rt.imdb).unwrap();
    rt.shell = Some(shell);
    rt
}

fn add_stmt(rt: &mut Runtime, name: &str, text: &str) {
    let mut shell = rt.shell.take().unwrap();
    shell.stmt_parse(&mut rt.imdb, rt.clock.as_ref(), text, name).unwrap();
    rt.shell = Some(shell);
}

fn advance(rt: &mut Runtime, secs: u32) {
    let now = rt.clock.ctime();
    let base = rt.clock.time_at(0);
    let mut clk = SimClock::new(base);
    clk.tick(now + secs);
    rt.clock = Box::new(clk);
}

fn global_value(rt: &Runtime, name: &[u8]) -> u32 {
    let shell = rt.shell.as_ref().unwrap();
    shell.globals.lookup(name).map(|off| shell.globals.value(off)).unwrap_or(0)
}

#[test]
fn test_minute_tick_fires_once_per_minute() {
    let mut rt = runtime();
    let timer = SimTimer::new();
    let mut core = SchedCore::start(&mut rt, Box::new(timer.clone())).unwrap();

    add_stmt(&mut rt, "tick_stmt", "## ticks; ticks := ticks + 1;");
    core.entry_add(&mut rt, "tick", false, "0 */1 * * *", "tick_stmt", &[]).unwrap();

    // Armed for the next minute boundary: 40 seconds away.
    let wait = timer.armed().expect("timer armed");
    assert_eq!(wait, 40_000);

    let mut fire_times = Vec::new();
    for round in 1..=3u32 {
        let wait_ms = timer.armed().expect("armed");
        advance(&mut rt, (wait_ms / 1000) as u32);
        core.on_timer(&mut rt);
        assert_eq!(global_value(&rt, b"ticks"), round, "one evaluation per fire");
        fire_times.push(rt.clock.time());
    }

    // Fires land on second zero, sixty seconds apart.
    for t in &fire_times {
        assert_eq!(t % 60, 0);
    }
    assert_eq!(fire_times[1] - fire_times[0], 60);
    assert_eq!(fire_times[2] - fire_times[1], 60);

    // Accounting advanced with each run.
    let row = core.entry_get(&mut rt, "tick").unwrap();
    let obj = rt.imdb.obj(row).unwrap();
    let run_count = u16::from_le_bytes(obj[68..70].try_into().unwrap());
    assert_eq!(run_count, 3);
}

#[test]
fn test_adjtime_rearms_against_new_wall_clock() {
    let mut rt = runtime();
    let timer = SimTimer::new();
    let mut core = SchedCore::start(&mut rt, Box::new(timer.clone())).unwrap();

    add_stmt(&mut rt, "s", "## n; n := n + 1;");
    core.entry_add(&mut rt, "e", false, "0 */1 * * *", "s", &[]).unwrap();
    let before = timer.armed().unwrap();
    assert_eq!(before, 40_000);

    // Step the wall clock 30 seconds forward; ADJTIME recomputes.
    let now_unix = rt.clock.time();
    rt.clock.adjust(now_unix + 30);
    core.set_all_next_time(&mut rt, true);
    let after = timer.armed().unwrap();
    assert_eq!(after, 10_000);
}

#[test]
fn test_signal_entry_still_bounded_by_timer_horizon() {
    let mut rt = runtime();
    let timer = SimTimer::new();
    let mut core = SchedCore::start(&mut rt, Box::new(timer.clone())).unwrap();
    add_stmt(&mut rt, "s", "print(1);");

    // Rare time selection plus a signal subscription: the armed timer
    // never reaches further than an hour out.
    core.entry_add(&mut rt, "sig", false, "@1 0 0 0 1 0", "s", &[]).unwrap();
    let armed = timer.armed().unwrap();
    assert!(armed <= 3_600_000);
}

#[test]
fn test_timer_horizon_capped_at_one_hour() {
    let mut rt = runtime();
    let timer = SimTimer::new();
    let mut core = SchedCore::start(&mut rt, Box::new(timer.clone())).unwrap();
    add_stmt(&mut rt, "s", "print(1);");

    // Fires at midnight: nearly two hours away from 22:13:20.
    core.entry_add(&mut rt, "midnight", false, "0 0 0 * *", "s", &[]).unwrap();
    assert_eq!(timer.armed().unwrap(), 3_600_000);
}
