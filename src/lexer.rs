use std::fs::File;
use std::io::{self, BufReader, Read};
use std::ffi::OsStr;
use std::os::unix::ffi::OsStrExt;
use std::path::Path;

use tracing::debug;

use crate::error::{ConfError, Position, Result, SyntaxErrorKind};

/// Name reported for the outermost stream when it has none.
pub const TOPLEVEL_NAME: &str = "_toplevel_";

/// One open stream on the include stack.
struct Source {
    name: Option<String>,
    bytes: io::Bytes<BufReader<Box<dyn Read>>>,
    position: Position,
}

impl Source {
    fn new(name: Option<String>, reader: Box<dyn Read>) -> Self {
        Source {
            name,
            bytes: BufReader::new(reader).bytes(),
            position: Position::start(),
        }
    }

    fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(TOPLEVEL_NAME)
    }
}

/// Byte scanner over a stack of nested input streams.
///
/// `<path>` at the start of a token pushes a new stream; reaching the end of
/// an included stream silently resumes the includer. Streams are closed when
/// they are popped or when the `Input` is dropped.
pub struct Input {
    stack: Vec<Source>,
    pending: Option<Option<u8>>,
}

impl Input {
    pub fn from_reader(name: Option<String>, reader: impl Read + 'static) -> Self {
        Input {
            stack: vec![Source::new(name, Box::new(reader))],
            pending: None,
        }
    }

    /// Scan an in-memory text as the unnamed top-level stream.
    pub fn from_text(text: &str) -> Self {
        Self::from_reader(None, io::Cursor::new(text.as_bytes().to_vec()))
    }

    /// Open a file as the top-level stream, named after its path.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path).map_err(|source| ConfError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(Self::from_reader(Some(path.display().to_string()), file))
    }

    /// Name of the stream currently being read.
    pub fn name(&self) -> &str {
        self.stack
            .last()
            .map(Source::display_name)
            .unwrap_or(TOPLEVEL_NAME)
    }

    pub fn position(&self) -> Position {
        self.stack
            .last()
            .map(|source| source.position)
            .unwrap_or_else(Position::start)
    }

    /// Number of open streams, the top-level one included.
    pub fn depth(&self) -> usize {
        self.stack.len()
    }

    /// Build a syntax error located at the current stream position.
    pub fn error(&self, kind: SyntaxErrorKind) -> ConfError {
        ConfError::syntax(self.name(), self.position(), kind)
    }

    fn push_file(&mut self, path: &[u8]) -> Result<()> {
        let path = Path::new(OsStr::from_bytes(path));
        let file = File::open(path).map_err(|source| ConfError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let name = path.display().to_string();
        debug!(path = %name, depth = self.stack.len(), "entering included file");
        self.stack.push(Source::new(Some(name), Box::new(file)));
        Ok(())
    }

    // ── Characters ──────────────────────────────────────────────────

    /// Next byte, or `None` once the outermost stream is exhausted.
    pub fn get_char(&mut self) -> Result<Option<u8>> {
        if let Some(pending) = self.pending.take() {
            return Ok(pending);
        }
        loop {
            let Some(source) = self.stack.last_mut() else {
                return Ok(None);
            };
            match source.bytes.next() {
                Some(Ok(byte)) => {
                    let pos = &mut source.position;
                    match byte {
                        b'\n' => {
                            pos.line += 1;
                            pos.column = 0;
                        }
                        b'\t' => pos.column += 8 - pos.column % 8,
                        _ => pos.column += 1,
                    }
                    return Ok(Some(byte));
                }
                Some(Err(err)) => {
                    return Err(ConfError::Io {
                        path: source.display_name().into(),
                        source: err,
                    })
                }
                None if self.stack.len() > 1 => {
                    self.stack.pop();
                }
                None => return Ok(None),
            }
        }
    }

    /// Push one byte (or end of input) back.
    ///
    /// # Panics
    ///
    /// Panics if a byte is already pending.
    pub fn unget(&mut self, ch: Option<u8>) {
        assert!(self.pending.is_none(), "only one byte of pushback");
        self.pending = Some(ch);
    }

    fn get_char_skip_comments(&mut self) -> Result<Option<u8>> {
        loop {
            match self.get_char()? {
                Some(b'<') => {
                    let path = self.get_delimstring(b'>')?;
                    self.push_file(&path)?;
                }
                Some(b'#') => loop {
                    match self.get_char()? {
                        None => return Ok(None),
                        Some(b'\n') => break,
                        Some(_) => {}
                    }
                },
                other => return Ok(other),
            }
        }
    }

    /// Skip blanks, comments and includes; return the first significant byte.
    pub fn get_nonwhite(&mut self) -> Result<Option<u8>> {
        loop {
            match self.get_char_skip_comments()? {
                Some(b' ' | b'\x0c' | b'\t' | b'\n' | b'\r') => {}
                other => return Ok(other),
            }
        }
    }

    // ── Strings ─────────────────────────────────────────────────────

    /// Decode the byte after a backslash. `None` means the input ended.
    fn get_quotedchar(&mut self) -> Result<Option<u8>> {
        let Some(ch) = self.get_char()? else {
            return Ok(None);
        };
        let decoded = match ch {
            b'n' => b'\n',
            b't' => b'\t',
            b'v' => b'\x0b',
            b'b' => b'\x08',
            b'r' => b'\r',
            b'f' => b'\x0c',
            b'0'..=b'7' => {
                let mut num = u32::from(ch - b'0');
                for _ in 1..3 {
                    match self.get_char()? {
                        Some(digit @ b'0'..=b'7') => num = num * 8 + u32::from(digit - b'0'),
                        other => {
                            self.unget(other);
                            break;
                        }
                    }
                }
                num as u8
            }
            other => other,
        };
        Ok(Some(decoded))
    }

    /// Read an unquoted token. In identifier context `.` also terminates it.
    fn get_freestring(&mut self, id: bool) -> Result<Vec<u8>> {
        let mut buf = Vec::new();
        loop {
            let ch = self.get_char()?;
            match ch {
                Some(b'.') if !id => {}
                None
                | Some(
                    b'.' | b' ' | b'\x0c' | b'\t' | b'\n' | b'\r' | b'=' | b',' | b';' | b'{'
                    | b'}' | b'[' | b']' | b'\'' | b'"' | b'\\' | b'#',
                ) => {
                    self.unget(ch);
                    return Ok(buf);
                }
                Some(_) => {}
            }
            if let Some(byte) = ch {
                buf.push(byte);
            }
        }
    }

    /// Read up to the closing `delim`, decoding backslash escapes.
    fn get_delimstring(&mut self, delim: u8) -> Result<Vec<u8>> {
        let mut buf = Vec::new();
        loop {
            let byte = match self.get_char()? {
                None => return Err(self.error(SyntaxErrorKind::UnterminatedString)),
                Some(b'\\') => match self.get_quotedchar()? {
                    Some(decoded) => decoded,
                    None => return Err(self.error(SyntaxErrorKind::UnterminatedQuote)),
                },
                Some(ch) if ch == delim => {
                    return Ok(buf);
                }
                Some(ch) => ch,
            };
            buf.push(byte);
        }
    }

    /// Read one token: a quoted string or a free-form string.
    pub fn get_string(&mut self, id: bool) -> Result<Vec<u8>> {
        match self.get_nonwhite()? {
            None => Err(self.error(SyntaxErrorKind::UnexpectedEof)),
            Some(b'=' | b',' | b';' | b'.' | b'{' | b'}' | b'[' | b']') => {
                Err(self.error(SyntaxErrorKind::UnexpectedChar))
            }
            Some(delim @ (b'\'' | b'"')) => self.get_delimstring(delim),
            other => {
                self.unget(other);
                let token = self.get_freestring(id)?;
                if token.is_empty() {
                    // Only a stray backslash can end a token before it starts.
                    self.get_char()?;
                    return Err(self.error(SyntaxErrorKind::UnexpectedChar));
                }
                Ok(token)
            }
        }
    }
}

/// Decode backslash escapes the way quoted config strings do.
///
/// Used for quoted argument values, which never come from a stream.
pub fn unescape(text: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(text.len());
    let mut bytes = text.iter().copied().peekable();
    while let Some(ch) = bytes.next() {
        if ch != b'\\' {
            out.push(ch);
            continue;
        }
        let Some(next) = bytes.next() else {
            break;
        };
        let decoded = match next {
            b'n' => b'\n',
            b't' => b'\t',
            b'v' => b'\x0b',
            b'b' => b'\x08',
            b'r' => b'\r',
            b'f' => b'\x0c',
            b'0'..=b'7' => {
                let mut num = u32::from(next - b'0');
                for _ in 1..3 {
                    match bytes.peek() {
                        Some(&digit @ b'0'..=b'7') => {
                            num = num * 8 + u32::from(digit - b'0');
                            bytes.next();
                        }
                        _ => break,
                    }
                }
                num as u8
            }
            other => other,
        };
        out.push(decoded);
    }
    out
}
