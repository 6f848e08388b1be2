//! Console menu over a shared stack

use anyhow::Result;
use shm_coord_core::stack::CAPACITY;
use shm_coord_core::{CoordError, SharedStack};
use std::io::{BufRead, Write};

const MENU: &str = "\n1. Push\n2. Pop\n3. List\n4. Clear\n5. Exit\nChoice: ";

/// Run the menu until `5` or end of input
///
/// Full/empty stack conditions are reported to the user and the loop
/// continues; any other error ends the menu.
pub fn run_menu<R: BufRead, W: Write>(stack: &SharedStack, mut input: R, mut out: W) -> Result<()> {
    loop {
        write!(out, "{}", MENU)?;
        out.flush()?;

        let choice = match read_line(&mut input)? {
            Some(line) => line,
            None => break,
        };

        match choice.trim().parse::<u32>() {
            Ok(1) => {
                write!(out, "Text: ")?;
                out.flush()?;
                let item = match read_line(&mut input)? {
                    Some(item) => item,
                    None => break,
                };
                match stack.push(&item) {
                    Ok(len) => writeln!(out, "Pushed ({}/{} entries)", len, CAPACITY)?,
                    Err(e @ CoordError::StackFull { .. }) => writeln!(out, "{}", e)?,
                    Err(e) => return Err(e.into()),
                }
            }
            Ok(2) => match stack.pop() {
                Ok(item) => writeln!(out, "Popped: {}", item)?,
                Err(CoordError::StackEmpty) => writeln!(out, "Stack is empty")?,
                Err(e) => return Err(e.into()),
            },
            Ok(3) => {
                let entries = stack.peek_all()?;
                if entries.is_empty() {
                    writeln!(out, "Stack is empty")?;
                } else {
                    writeln!(out, "Stack ({} entries, top first):", entries.len())?;
                    for (depth, item) in entries.iter().enumerate() {
                        writeln!(out, "  {}: {}", depth, item)?;
                    }
                }
            }
            Ok(4) => {
                stack.clear()?;
                writeln!(out, "Stack cleared")?;
            }
            Ok(5) => break,
            _ => writeln!(out, "Invalid choice {:?}, enter 1-5", choice.trim())?,
        }
    }

    Ok(())
}

/// One line without its terminator; `None` at end of input
///
/// Invalid UTF-8 is replaced rather than ending the session.
fn read_line<R: BufRead>(input: &mut R) -> Result<Option<String>> {
    let mut bytes = Vec::new();
    if input.read_until(b'\n', &mut bytes)? == 0 {
        return Ok(None);
    }
    let line = String::from_utf8_lossy(&bytes);
    Ok(Some(line.trim_end_matches(&['\n', '\r'][..]).to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use shm_coord_shared_memory::{SegmentOptions, SessionNames};
    use std::io::Cursor;
    use std::time::Duration;

    fn open_stack(prefix: &str) -> SharedStack {
        let names = SessionNames::generate(prefix).unwrap();
        let options = SegmentOptions {
            acquire_timeout: Some(Duration::from_secs(10)),
            ..SegmentOptions::default()
        };
        SharedStack::open(&names, options).unwrap()
    }

    fn drive(stack: &SharedStack, script: &str) -> String {
        let mut out = Vec::new();
        run_menu(stack, Cursor::new(script), &mut out).unwrap();
        String::from_utf8(out).unwrap()
    }

    #[test]
    fn test_scripted_session() {
        let stack = open_stack("menu-script");
        let out = drive(&stack, "1\nfirst\n1\nsecond line\r\n3\n2\n3\n4\n3\n5\n1\nnever\n");

        assert!(out.contains("Pushed (1/100 entries)"));
        assert!(out.contains("Pushed (2/100 entries)"));
        assert!(out.contains("  0: second line\n  1: first\n"));
        assert!(out.contains("Popped: second line"));
        assert!(out.contains("Stack cleared"));
        assert!(out.rfind("Stack is empty").unwrap() > out.find("Stack cleared").unwrap());
        assert!(!out.contains("never"));
        assert!(stack.is_empty().unwrap());

        stack.destroy().unwrap();
    }

    #[test]
    fn test_empty_and_invalid_input() {
        let stack = open_stack("menu-invalid");
        let out = drive(&stack, "2\nseven\n9\n");

        assert!(out.contains("Stack is empty"));
        assert!(out.contains("Invalid choice \"seven\", enter 1-5"));
        assert!(out.contains("Invalid choice \"9\", enter 1-5"));

        stack.destroy().unwrap();
    }

    #[test]
    fn test_invalid_utf8_line_does_not_end_session() {
        let stack = open_stack("menu-bytes");
        let script: &[u8] = b"1\nbad \xff\xfe bytes\n\xc3\n1\ngood\n3\n5\n";

        let mut out = Vec::new();
        run_menu(&stack, Cursor::new(script), &mut out).unwrap();
        let out = String::from_utf8(out).unwrap();

        assert!(out.contains("Invalid choice \"\u{fffd}\", enter 1-5"));
        assert!(out.contains("  0: good\n  1: bad \u{fffd}\u{fffd} bytes\n"));
        assert_eq!(stack.len().unwrap(), 2);

        stack.destroy().unwrap();
    }

    #[test]
    fn test_end_of_input_while_pushing() {
        let stack = open_stack("menu-eof");
        let out = drive(&stack, "1\n");
        assert!(out.ends_with("Text: "));
        assert!(stack.is_empty().unwrap());
        stack.destroy().unwrap();
    }

    #[test]
    fn test_full_stack_is_reported() {
        let stack = open_stack("menu-full");
        for i in 0..CAPACITY {
            stack.push(&i.to_string()).unwrap();
        }

        let out = drive(&stack, "1\noverflow\n5\n");
        assert!(out.contains("Stack is full (100 entries)"));
        assert_eq!(stack.len().unwrap(), CAPACITY);

        stack.destroy().unwrap();
    }

    #[test]
    fn test_destroyed_stack_ends_menu() {
        let stack = open_stack("menu-destroyed");
        stack.destroy().unwrap();

        let mut out = Vec::new();
        assert!(run_menu(&stack, Cursor::new("3\n"), &mut out).is_err());
    }
}
