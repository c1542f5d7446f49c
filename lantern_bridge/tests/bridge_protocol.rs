use std::collections::{BTreeMap, HashMap};
use std::rc::Rc;

use anyhow::Result;
use lantern_bridge::{
    Arity, Bridge, BridgeOptions, HostError, Mode, RecordingReporter, ScriptError, ScriptValue,
    SharedBuffer,
};

fn bridge() -> Result<Bridge> {
    Ok(Bridge::new(BridgeOptions::default())?)
}

fn define(bridge: &mut Bridge, source: &str) -> Result<()> {
    bridge.eval(source).pop()?;
    Ok(())
}

fn stairs_params() -> BTreeMap<String, String> {
    let mut params = BTreeMap::new();
    params.insert("id".to_string(), "stairs_1".to_string());
    params.insert("toMap".to_string(), "cellar".to_string());
    params.insert("toX".to_string(), "40".to_string());
    params
}

#[test]
fn call_sees_every_pushed_argument() -> Result<()> {
    let mut bridge = bridge()?;
    define(&mut bridge, "function count(...) return select('#', ...) end")?;

    let empty = bridge.call("count").pop_number()?;
    assert_eq!(empty, 0.0);

    let params = stairs_params();
    bridge
        .call("count")
        .push_number(1.0)
        .push_string("two")
        .push_table(&params);
    assert_eq!(
        bridge.mode(),
        &Mode::Calling {
            name: "count".to_string(),
            arg_count: 3
        }
    );
    assert_eq!(bridge.pop_number()?, 3.0);
    assert!(bridge.mode().is_idle());
    assert_eq!(bridge.stack_depth(), 0);
    Ok(())
}

#[test]
fn busy_leaves_pending_operation_untouched() -> Result<()> {
    let mut bridge = bridge()?;
    define(&mut bridge, "function add(a, b) return a + b end")?;

    bridge.call("add").push_number(1.0);
    bridge.call("add");
    assert_eq!(bridge.error(), Some(ScriptError::Busy));
    assert_eq!(
        bridge.mode(),
        &Mode::Calling {
            name: "add".to_string(),
            arg_count: 1
        }
    );
    assert_eq!(bridge.stack_depth(), 2);

    bridge.eval("return 1").set("x");
    assert_eq!(bridge.error(), Some(ScriptError::Busy));
    assert_eq!(bridge.stack_depth(), 2);
    Ok(())
}

#[test]
fn error_is_sticky_until_cleared() -> Result<()> {
    let mut bridge = bridge()?;
    bridge.call("nonexistentFn");
    assert_eq!(bridge.error(), Some(ScriptError::NotCallable));

    bridge.eval("return 1").push_number(2.0);
    assert_eq!(bridge.pop_number(), Err(ScriptError::NotCallable));
    assert_eq!(bridge.pop(), Err(ScriptError::NotCallable));
    assert!(bridge.mode().is_idle());

    bridge.clear_error();
    assert_eq!(bridge.error(), None);
    assert_eq!(bridge.stack_depth(), 0);
    assert_eq!(bridge.eval("return 1").pop_number(), Ok(1.0));
    Ok(())
}

#[test]
fn set_commits_on_first_push() -> Result<()> {
    let mut bridge = bridge()?;
    bridge.set("x").push_number(42.0);
    assert_eq!(bridge.error(), None);
    assert!(bridge.mode().is_idle());
    assert_eq!(bridge.stack_depth(), 0);
    assert_eq!(bridge.eval("return x").pop_number()?, 42.0);

    bridge.set("name").push_string("Grim");
    assert_eq!(bridge.eval("return name").pop_string()?, "Grim");
    Ok(())
}

#[test]
fn second_value_for_a_set_is_rejected() -> Result<()> {
    let mut bridge = bridge()?;
    bridge.set("y").push_number(1.0).push_number(2.0);
    assert_eq!(bridge.error(), Some(ScriptError::SetTooManyValues));

    bridge.clear_error();
    assert_eq!(bridge.eval("return y").pop_number()?, 1.0);
    Ok(())
}

#[test]
fn push_outside_an_operation_is_invalid() -> Result<()> {
    let mut bridge = bridge()?;
    bridge.push_string("stray");
    assert_eq!(bridge.error(), Some(ScriptError::InvalidPush));
    assert_eq!(bridge.stack_depth(), 0);
    Ok(())
}

#[test]
fn tables_round_trip() -> Result<()> {
    let mut bridge = bridge()?;
    let params = stairs_params();

    bridge.set("params").push_table(&params);
    assert_eq!(bridge.eval("return params").pop_table()?, params);

    define(&mut bridge, "function echo(t) return t end")?;
    let mut lookup: HashMap<&str, &str> = HashMap::new();
    lookup.insert("door", "open");
    lookup.insert("lamp", "lit");
    let echoed = bridge.call("echo").push_table(&lookup).pop_table()?;
    assert_eq!(echoed.len(), 2);
    assert_eq!(echoed["door"], "open");
    assert_eq!(echoed["lamp"], "lit");
    Ok(())
}

#[test]
fn table_pop_skips_non_string_entries() -> Result<()> {
    let mut bridge = bridge()?;
    let entries = bridge
        .eval(r#"return { name = "lamp", hp = 3, [1] = "first", lit = true }"#)
        .pop_table()?;
    assert_eq!(entries.len(), 1);
    assert_eq!(entries["name"], "lamp");
    Ok(())
}

#[test]
fn missing_function_is_not_callable() -> Result<()> {
    let mut bridge = bridge()?;
    bridge.call("nonexistentFn");
    assert_eq!(bridge.error(), Some(ScriptError::NotCallable));
    assert!(bridge.mode().is_idle());
    assert_eq!(bridge.stack_depth(), 0);

    bridge.clear_error();
    define(&mut bridge, "answer = 42")?;
    bridge.call("answer");
    assert_eq!(bridge.error(), Some(ScriptError::NotCallable));
    Ok(())
}

#[test]
fn throwing_call_reports_diagnostic() -> Result<()> {
    let reporter = RecordingReporter::new();
    let mut bridge = Bridge::with_reporter(BridgeOptions::default(), Rc::new(reporter.clone()))?;
    define(&mut bridge, "function explode()\n  error('boom')\nend")?;

    assert_eq!(bridge.call("explode").pop(), Err(ScriptError::CallFailed));
    let diagnostic = bridge
        .last_diagnostic()
        .expect("failed call should leave a diagnostic");
    assert_eq!(diagnostic.category, "RuntimeError");
    assert_eq!(diagnostic.message, "boom");
    assert_eq!(diagnostic.line, Some(2));

    let entries = reporter.entries();
    assert_eq!(entries.len(), 1);
    assert!(entries[0].starts_with("CallFailed"), "entry: {}", entries[0]);
    assert!(entries[0].contains("RuntimeError: boom"), "entry: {}", entries[0]);
    Ok(())
}

#[test]
fn syntax_error_fails_evaluation() -> Result<()> {
    let reporter = RecordingReporter::new();
    let options = BridgeOptions::default().with_chunk_name("level01");
    let mut bridge = Bridge::with_reporter(options, Rc::new(reporter.clone()))?;

    assert_eq!(bridge.eval("return = 1").pop(), Err(ScriptError::EvalFailed));
    let diagnostic = bridge.last_diagnostic().expect("diagnostic");
    assert_eq!(diagnostic.category, "SyntaxError");
    assert_eq!(diagnostic.file, "level01");
    assert_eq!(reporter.entries().len(), 1);
    Ok(())
}

#[test]
fn type_mismatch_keeps_result_and_mode() -> Result<()> {
    let mut bridge = bridge()?;
    assert_eq!(
        bridge.eval("return 'not a number'").pop_number(),
        Err(ScriptError::PopTypeMismatch)
    );
    assert!(matches!(bridge.mode(), Mode::Evaluating { .. }));
    assert_eq!(bridge.stack_depth(), 1);

    bridge.clear_error();
    assert!(bridge.mode().is_idle());
    assert_eq!(bridge.stack_depth(), 0);
    Ok(())
}

#[test]
fn call_result_type_mismatch_keeps_call_pending() -> Result<()> {
    let mut bridge = bridge()?;
    define(&mut bridge, "function label(n) return 'floor ' .. n end")?;

    assert_eq!(
        bridge.call("label").push_number(3.0).pop_number(),
        Err(ScriptError::PopTypeMismatch)
    );
    assert!(matches!(
        bridge.mode(),
        Mode::Calling { arg_count: 1, .. }
    ));
    assert_eq!(bridge.stack_depth(), 1);
    Ok(())
}

#[test]
fn non_utf8_results_decode_the_same_through_every_pop() -> Result<()> {
    let mut bridge = bridge()?;
    let replaced = "\u{FFFD}\u{FFFD}".to_string();
    assert_eq!(bridge.eval(r#"return "\255\254""#).pop_string()?, replaced);
    assert_eq!(
        bridge.eval(r#"return "\255\254""#).pop_value()?,
        ScriptValue::String(replaced)
    );

    let entries = bridge
        .eval(r#"return { k = "\255", ok = "x" }"#)
        .pop_table()?;
    assert_eq!(entries.len(), 2);
    assert_eq!(entries["k"], "\u{FFFD}");
    assert_eq!(entries["ok"], "x");
    Ok(())
}

#[test]
fn hash_map_results_decode_through_pop_as() -> Result<()> {
    let mut bridge = bridge()?;
    let entries: HashMap<String, String> = bridge
        .eval(r#"return { door = "open" }"#)
        .pop_as()?;
    assert_eq!(entries.get("door").map(String::as_str), Some("open"));
    Ok(())
}

#[test]
fn throwing_global_lookup_is_fatal() -> Result<()> {
    let mut bridge = bridge()?;
    define(
        &mut bridge,
        "setmetatable(_G, { __index = function(_, key) error('undefined global ' .. key) end })",
    )?;

    bridge.call("nonexistentFn");
    assert_eq!(bridge.error(), Some(ScriptError::Fatal));
    assert!(bridge.mode().is_idle());
    assert_eq!(bridge.stack_depth(), 0);
    let notice = bridge.take_fatal().expect("fatal notice");
    assert!(notice.contains("undefined global nonexistentFn"), "notice: {notice}");
    Ok(())
}

#[test]
fn context_exposes_the_interpreter() -> Result<()> {
    let mut bridge = bridge()?;
    bridge.set("hp").push_number(10.0);
    let hp: f64 = bridge.context().lua().globals().get("hp")?;
    assert_eq!(hp, 10.0);
    assert_eq!(bridge.context().depth(), 0);
    Ok(())
}

#[test]
fn pop_value_describes_any_result() -> Result<()> {
    let mut bridge = bridge()?;
    assert_eq!(bridge.eval("return nil").pop_value()?, ScriptValue::Nil);
    assert_eq!(bridge.eval("return true").pop_value()?, ScriptValue::Boolean(true));
    assert_eq!(bridge.eval("return 1.5").pop_value()?, ScriptValue::Number(1.5));
    assert_eq!(
        bridge.eval("return print").pop_value()?,
        ScriptValue::Opaque("function")
    );
    assert_eq!(bridge.eval("return 1, 2").pop_number()?, 1.0);
    Ok(())
}

#[test]
fn shared_buffer_aliases_host_memory() -> Result<()> {
    let mut bridge = bridge()?;
    let pixels = SharedBuffer::new(vec![0i32; 3]);
    bridge.set("pixels").push_buffer(pixels.clone());

    assert_eq!(bridge.eval("pixels[1] = 42 return #pixels").pop_number()?, 3.0);
    assert_eq!(pixels.to_vec(), vec![42, 0, 0]);

    pixels.borrow_mut()[2] = -7;
    assert_eq!(bridge.eval("return pixels[3]").pop_number()?, -7.0);
    assert_eq!(bridge.eval("return pixels.length").pop_number()?, 3.0);
    assert_eq!(
        bridge.eval("return tostring(pixels)").pop_string()?,
        "Int32Array(3)"
    );

    assert_eq!(bridge.eval("pixels[4] = 1").pop(), Err(ScriptError::EvalFailed));
    Ok(())
}

#[test]
fn unsigned_buffer_wraps_stored_values() -> Result<()> {
    let mut bridge = bridge()?;
    let words = SharedBuffer::<u32>::zeroed(5);
    bridge.set("words").push_buffer(words.clone());
    define(
        &mut bridge,
        "words[1] = -1 words[2] = 4294967297 words[3] = 2^64 + 2^33 words[4] = 1/0 words[5] = 0/0",
    )?;
    assert_eq!(words.to_vec(), vec![u32::MAX, 1, 0, 0, 0]);
    Ok(())
}

#[test]
fn external_buffer_writes_reach_caller_memory() -> Result<()> {
    let mut region = [0u32; 4];
    {
        let mut bridge = bridge()?;
        // SAFETY: the bridge, and with it every script reference to the
        // view, is dropped before `region` is read again.
        unsafe {
            bridge.set("frame").push_external_buffer(&mut region);
        }
        assert_eq!(bridge.error(), None);
        assert_eq!(bridge.eval("frame[2] = 9 return frame.length").pop_number()?, 4.0);
    }
    assert_eq!(region, [0, 9, 0, 0]);
    Ok(())
}

#[test]
fn callbacks_see_declared_arity() -> Result<()> {
    let mut bridge = bridge()?;
    bridge
        .set("pair")
        .push_function(Arity::Fixed(2), |args| Ok(ScriptValue::Number(args.len() as f64)));
    bridge
        .set("any")
        .push_function(Arity::Variadic, |args| Ok(ScriptValue::Number(args.len() as f64)));

    assert_eq!(bridge.eval("return pair(1)").pop_number()?, 2.0);
    assert_eq!(bridge.eval("return pair(1, 2, 3)").pop_number()?, 2.0);
    assert_eq!(bridge.eval("return any(1, 2, 3)").pop_number()?, 3.0);
    assert_eq!(bridge.eval("return any()").pop_number()?, 0.0);
    Ok(())
}

#[test]
fn callback_receives_script_values() -> Result<()> {
    let mut bridge = bridge()?;
    bridge.set("describe").push_function(Arity::Fixed(2), |args| {
        let name = args[0].as_str().unwrap_or("?");
        let hp = args[1].as_number().unwrap_or(0.0);
        Ok(ScriptValue::String(format!("{name}:{}", hp * 2.0)))
    });
    assert_eq!(
        bridge.eval("return describe('lamp', 3)").pop_string()?,
        "lamp:6"
    );
    Ok(())
}

#[test]
fn callback_failure_surfaces_as_host_error() -> Result<()> {
    let reporter = RecordingReporter::new();
    let mut bridge = Bridge::with_reporter(BridgeOptions::default(), Rc::new(reporter.clone()))?;
    bridge
        .set("unlock")
        .push_function(Arity::Variadic, |_| Err(HostError::new("door is locked")));

    assert_eq!(bridge.call("unlock").pop(), Err(ScriptError::CallFailed));
    let diagnostic = bridge.last_diagnostic().expect("diagnostic");
    assert_eq!(diagnostic.category, "HostError");
    assert_eq!(diagnostic.message, "door is locked");
    Ok(())
}

#[test]
fn heap_exhaustion_is_fatal() -> Result<()> {
    let reporter = RecordingReporter::new();
    let options = BridgeOptions::default().with_memory_limit(1024 * 1024);
    let mut bridge = Bridge::with_reporter(options, Rc::new(reporter.clone()))?;
    let signal = bridge.fatal_signal();

    let hog = "local t = {} for i = 1, 10000000 do t[i] = string.rep('x', 64) .. i end return #t";
    assert_eq!(bridge.eval(hog).pop_number(), Err(ScriptError::Fatal));
    assert!(signal.is_raised());
    assert_eq!(bridge.error(), Some(ScriptError::Fatal));
    assert!(bridge.last_diagnostic().is_none());

    let entries = reporter.entries();
    assert_eq!(entries.len(), 1);
    assert!(entries[0].starts_with("Fatal"), "entry: {}", entries[0]);

    assert!(bridge.take_fatal().is_some());
    assert!(bridge.take_fatal().is_none());
    assert_eq!(bridge.eval("return 1").pop_number(), Err(ScriptError::Fatal));
    Ok(())
}
