// Shell program scenarios: parse, dump, evaluate.

use std::sync::{Arc, Mutex};

use things_shell::imdb::{Imdb, ImdbDef};
use things_shell::lsh::{FuncEntry, ShArgVal, Shell};
use things_shell::platform::sim::SimClock;
use things_shell::ShError;

fn shell() -> (Imdb, Shell, SimClock) {
    let mut imdb = Imdb::init(ImdbDef { block_size: 1024 });
    let shell = Shell::start(&mut imdb).unwrap();
    (imdb, shell, SimClock::new(1_700_000_000))
}

#[test]
fn test_program_dump_and_eval() {
    let (mut imdb, mut shell, clock) = shell();

    let calls: Arc<Mutex<Vec<Vec<ShArgVal>>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = calls.clone();
    shell
        .func_register(
            &mut imdb,
            FuncEntry {
                service_id: 0,
                name: "probe".to_string(),
                func: Box::new(move |_ctx, args| {
                    sink.lock().unwrap().push(args.to_vec());
                    Ok(0)
                }),
            },
        )
        .unwrap();

    let row = shell
        .stmt_parse(&mut imdb, &clock, "# x := 3 + 4 * 2; probe(x);", "calc")
        .unwrap();

    // Operand-producing records precede their consumers: the declaration,
    // then the tight product, the sum, the assignment, the call.
    let dump = shell.stmt_dump(&imdb, row, true).unwrap();
    let tokens: Vec<&str> = dump.lines().filter_map(|l| l.split('\t').nth(2)).collect();
    assert_eq!(tokens, vec!["#", "*", "+", ":=", "()", "ret"]);
    assert!(dump.contains("<probe>"));

    shell.stmt_eval(&mut imdb, &clock, row).unwrap();
    let calls = calls.lock().unwrap();
    assert_eq!(calls.len(), 1, "one call per evaluation");
    assert_eq!(calls[0], vec![ShArgVal::Int(11)]);
}

#[test]
fn test_dump_reparse_yields_identical_bytecode() {
    let (mut imdb, mut shell, clock) = shell();
    let src = "# a := 10; # b := a * 3 - 4; print(b, \"done\");";

    let r1 = shell.stmt_parse(&mut imdb, &clock, src, "one").unwrap();
    let r2 = shell.stmt_parse(&mut imdb, &clock, src, "two").unwrap();

    let len1 = shell.stmt_info(&imdb, r1).unwrap().length as usize;
    let len2 = shell.stmt_info(&imdb, r2).unwrap().length as usize;
    assert_eq!(len1, len2);
    let bc1 = imdb.obj(r1).unwrap()[36..36 + len1].to_vec();
    let bc2 = imdb.obj(r2).unwrap()[36..36 + len2].to_vec();
    assert_eq!(bc1, bc2);
}

#[test]
fn test_conditionals_drive_globals() {
    let (mut imdb, mut shell, clock) = shell();
    let row = shell
        .stmt_parse(
            &mut imdb,
            &clock,
            "## mode; ## hits; mode = 1 ?? { hits := hits + 1; } : { hits := hits + 100; };",
            "cond",
        )
        .unwrap();

    // mode starts at 0: else branch.
    shell.stmt_eval(&mut imdb, &clock, row).unwrap();
    let hits = shell.globals.lookup(b"hits").unwrap();
    assert_eq!(shell.globals.value(hits), 100);

    // Flip the global and run again: then branch.
    let mode = shell.globals.lookup(b"mode").unwrap();
    shell.globals.set_value(mode, 1);
    shell.stmt_eval(&mut imdb, &clock, row).unwrap();
    assert_eq!(shell.globals.value(hits), 101);
}

#[test]
fn test_eval_does_not_touch_neighbouring_statements() {
    // Evaluation writes only inside the statement's own bytecode and the
    // global table: a neighbouring statement's image stays bit-identical.
    let (mut imdb, mut shell, clock) = shell();
    let witness = shell
        .stmt_parse(&mut imdb, &clock, "# w := 123;", "witness")
        .unwrap();
    let frozen = imdb.obj(witness).unwrap().to_vec();

    let worker = shell
        .stmt_parse(&mut imdb, &clock, "## n; n := n + 7;", "worker")
        .unwrap();
    for _ in 0..5 {
        shell.stmt_eval(&mut imdb, &clock, worker).unwrap();
    }

    assert_eq!(imdb.obj(witness).unwrap(), &frozen[..]);
    let n = shell.globals.lookup(b"n").unwrap();
    assert_eq!(shell.globals.value(n), 35);
}

#[test]
fn test_parse_failures_do_not_store_statements() {
    let (mut imdb, mut shell, clock) = shell();
    assert_eq!(
        shell.stmt_parse(&mut imdb, &clock, "# x := unknown_var;", "bad"),
        Err(ShError::VariableUndefined)
    );
    assert_eq!(shell.stmt_get(&mut imdb, "bad"), Err(ShError::StmtNotExists));
}
