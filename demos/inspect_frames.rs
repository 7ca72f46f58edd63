//! Print the frame metadata of an APNG or GIF file
use animframes::{open_reader, DecodeConfig, Format, ImageReader, Source};
use std::env;

fn main() {
    env_logger::init();
    let args: Vec<String> = env::args().collect();
    if args.len() < 2 {
        eprintln!("Usage: {} <apng-or-gif-file>", args[0]);
        std::process::exit(1);
    }

    let path = &args[1];
    let data = std::fs::read(path).expect("Failed to read file");
    let Some(format) = Format::detect(&data) else {
        eprintln!("{path}: neither PNG nor GIF");
        std::process::exit(1);
    };

    let mut reader = match open_reader(format, Source::Bytes(data), &DecodeConfig::default()) {
        Ok(reader) => reader,
        Err(e) => {
            eprintln!("Open error: {e}");
            std::process::exit(1);
        }
    };

    println!("File: {path} ({format:?})");
    println!("Canvas: {}x{}", reader.width(), reader.height());
    match reader.num_frames() {
        0 => println!("Declared frames: (not declared)"),
        n => println!("Declared frames: {n}"),
    }

    let mut total = 0.0;
    for (i, frame) in reader.frames().enumerate() {
        match frame {
            Ok(frame) => {
                total += frame.delay;
                println!(
                    "  Frame {i}: {}x{} at ({}, {}), delay {:.3}s, dispose {:?}, blend {:?}",
                    frame.width, frame.height, frame.x, frame.y, frame.delay, frame.dispose_op, frame.blend_op
                );
            }
            Err(e) => {
                eprintln!("  Frame {i}: decode error: {e}");
                std::process::exit(1);
            }
        }
    }

    match reader.loop_count() {
        Some(0) => println!("Loops: forever"),
        Some(n) => println!("Loops: {n}"),
        None => println!("Loops: once (no loop count)"),
    }
    println!("Total duration: {total:.3} seconds");
}
