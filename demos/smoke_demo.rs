use chain_hash::EntryRef;
use chain_hash::HashTable;
use clap::Parser;

const KEYS: [&str; 9] = [
    "a",
    "aa",
    "ab",
    "aaa",
    "aab",
    "Much longer key",
    "Abraca",
    "Hello",
    "Goodbye",
];

const VALS: [&str; 9] = [
    "z",
    "zz",
    "zx",
    "zzz",
    "zzx",
    "With a bit longer value",
    "Dabra",
    "World",
    "Universe",
];

#[derive(Parser, Debug)]
struct Args {
    #[arg(short = 'c', long = "capacity", default_value_t = 4)]
    capacity: usize,
}

/// Keys and values are stored NUL-terminated, so the terminator is part of the
/// stored bytes.
fn cstr(s: &str) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(s.len() + 1);
    bytes.extend_from_slice(s.as_bytes());
    bytes.push(0);
    bytes
}

fn show(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes.strip_suffix(b"\0").unwrap_or(bytes)).into_owned()
}

fn dump(entry: EntryRef<'_>) {
    println!("\"{}\"=\"{}\"", show(entry.key()), show(entry.value()));
}

fn lookup(table: &HashTable, key: &str) {
    let value = table
        .get(&cstr(key))
        .map(|e| show(e.value()))
        .unwrap_or_else(|| "(null)".to_string());
    println!(
        "map[\"{}\"] = \"{}\" size={} capacity={}",
        key,
        value,
        table.len(),
        table.capacity()
    );
}

fn main() {
    env_logger::init();
    let args = Args::parse();

    let mut table = HashTable::with_capacity(args.capacity);
    for (key, val) in KEYS.iter().zip(VALS) {
        if let Err(err) = table.put(&cstr(key), &cstr(val)) {
            eprintln!("put \"{key}\" failed: {err}");
            continue;
        }
        lookup(&table, key);
    }

    println!("----");
    table.iterate(dump);
    println!("----");

    #[cfg(feature = "stats")]
    {
        table.print_chain_histogram();
        table.debug_stats().print();
        println!("----");
    }

    for key in KEYS {
        lookup(&table, key);
        table.remove(&cstr(key));
    }
    println!(
        "after removal: size={} capacity={}",
        table.len(),
        table.capacity()
    );
}
