use crate::flow::StreamPosition;
use std::fs::File;
use std::io::{self, BufRead, BufReader, Cursor, Read, Seek, SeekFrom};
use std::path::Path;

pub trait ReadSeek: Read + Seek + Send {}

impl<T: Read + Seek + Send> ReadSeek for T {}

pub struct ScriptStream {
    reader: BufReader<Box<dyn ReadSeek>>,
    position: StreamPosition,
}

/// One line of a script and where it started.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptLine {
    pub offset: StreamPosition,
    pub text: String,
    raw: Vec<u8>,
}

impl ScriptLine {
    /// Stream position of byte `at` of `text`.
    ///
    /// `text` is decoded lossily, so each invalid sequence in the raw line
    /// became one replacement character of a different length.
    pub fn position_of(&self, at: usize) -> StreamPosition {
        let (mut text_len, mut raw_len) = (0, 0);
        for chunk in self.raw.utf8_chunks() {
            let valid = chunk.valid().len();
            if at <= text_len + valid {
                return self.offset.advance(raw_len + at - text_len);
            }
            text_len += valid;
            raw_len += valid + chunk.invalid().len();
            if !chunk.invalid().is_empty() {
                text_len += char::REPLACEMENT_CHARACTER.len_utf8();
            }
        }
        self.offset.advance(raw_len)
    }
}

impl ScriptStream {
    pub fn new(source: impl ReadSeek + 'static) -> Self {
        Self {
            reader: BufReader::new(Box::new(source)),
            position: StreamPosition(0),
        }
    }

    pub fn open(path: impl AsRef<Path>) -> io::Result<Self> {
        Ok(Self::new(File::open(path)?))
    }

    pub fn from_text(text: impl Into<String>) -> Self {
        Self::new(Cursor::new(text.into().into_bytes()))
    }

    pub fn position(&self) -> StreamPosition {
        self.position
    }

    pub fn seek(&mut self, position: StreamPosition) -> io::Result<()> {
        self.reader.seek(SeekFrom::Start(position.0))?;
        self.position = position;
        Ok(())
    }

    /// Reads through the next newline. `None` at end of input.
    pub fn read_line(&mut self) -> io::Result<Option<ScriptLine>> {
        let mut buf = Vec::new();
        let n = self.reader.read_until(b'\n', &mut buf)?;
        if n == 0 {
            return Ok(None);
        }
        let offset = self.position;
        self.position = offset.advance(n);
        Ok(Some(ScriptLine {
            offset,
            text: String::from_utf8_lossy(&buf).into_owned(),
            raw: buf,
        }))
    }
}

impl std::fmt::Debug for ScriptStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScriptStream")
            .field("position", &self.position)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_lines_carry_offsets() {
        let mut stream = ScriptStream::from_text("one\ntwo\nthree");
        let lines: Vec<_> = std::iter::from_fn(|| stream.read_line().unwrap()).collect();
        let offsets: Vec<_> = lines.iter().map(|l| l.offset.0).collect();
        assert_eq!(offsets, [0, 4, 8]);
        assert_eq!(lines[2].text, "three");
        assert_eq!(stream.position(), StreamPosition(13));
    }

    #[test]
    fn test_seek_mid_line_rereads_rest() {
        let mut stream = ScriptStream::from_text("a; b\nc\n");
        stream.read_line().unwrap();
        stream.read_line().unwrap();
        stream.seek(StreamPosition(3)).unwrap();

        let line = stream.read_line().unwrap().unwrap();
        assert_eq!(line.offset, StreamPosition(3));
        assert_eq!(line.text, "b\n");
        assert_eq!(stream.read_line().unwrap().unwrap().text, "c\n");
        assert!(stream.read_line().unwrap().is_none());
    }

    #[test]
    fn test_positions_skip_invalid_bytes() {
        let bytes = b"x \xff\xfe; while true\n".to_vec();
        let mut stream = ScriptStream::new(Cursor::new(bytes));
        let line = stream.read_line().unwrap().unwrap();
        assert_eq!(line.text, "x \u{fffd}\u{fffd}; while true\n");

        let at = line.text.find("while").unwrap();
        assert_eq!(at, 10);
        assert_eq!(line.position_of(at), StreamPosition(6));
        assert_eq!(line.position_of(2), StreamPosition(2));

        stream.seek(line.position_of(at)).unwrap();
        assert_eq!(stream.read_line().unwrap().unwrap().text, "while true\n");
    }

    #[test]
    fn test_open_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "echo hi\n").unwrap();
        let mut stream = ScriptStream::open(file.path()).unwrap();
        assert_eq!(stream.read_line().unwrap().unwrap().text, "echo hi\n");
    }
}
