// src/multipart.rs
//
// `multipart/form-data` part extraction over a fully buffered body. The
// boundary comes from the Content-Type header when present; otherwise it is
// detected from the body's first line. Bare-LF line breaks are tolerated
// everywhere CRLF is expected.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MultipartError {
    /// A part started but its closing boundary never appeared.
    Truncated,
}

#[derive(Debug)]
pub struct Part<'a> {
    pub name: Option<&'a str>,
    pub filename: Option<&'a str>,
    pub body: &'a [u8],
}

pub struct Multipart<'a> {
    body: &'a [u8],
    marker: Vec<u8>,
}

fn find(data: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || data.len() < needle.len() {
        return None;
    }
    data.windows(needle.len()).position(|w| w == needle)
}

impl<'a> Multipart<'a> {
    /// Boundary from the Content-Type header; the `--` prefix is added when
    /// missing.
    pub fn new(body: &'a [u8], boundary: &str) -> Self {
        let marker = if boundary.starts_with("--") {
            boundary.as_bytes().to_vec()
        } else {
            let mut m = Vec::with_capacity(boundary.len() + 2);
            m.extend_from_slice(b"--");
            m.extend_from_slice(boundary.as_bytes());
            m
        };
        Self { body, marker }
    }

    /// Fall back to the body's first line as the boundary marker.
    pub fn detect(body: &'a [u8]) -> Option<Self> {
        let line_len = match find(body, b"\r\n") {
            Some(idx) => idx,
            None => find(body, b"\n")?,
        };
        if line_len == 0 {
            return None;
        }
        Some(Self {
            body,
            marker: body[..line_len].to_vec(),
        })
    }

    pub fn boundary(&self) -> &[u8] {
        &self.marker
    }

    /// Earliest newline-prefixed boundary in `data`; returns the offset where
    /// the part body ends.
    fn next_boundary(&self, data: &[u8]) -> Option<usize> {
        let mut crlf_marker = Vec::with_capacity(self.marker.len() + 2);
        crlf_marker.extend_from_slice(b"\r\n");
        crlf_marker.extend_from_slice(&self.marker);
        let mut lf_marker = Vec::with_capacity(self.marker.len() + 1);
        lf_marker.push(b'\n');
        lf_marker.extend_from_slice(&self.marker);

        match (find(data, &crlf_marker), find(data, &lf_marker)) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (Some(a), None) => Some(a),
            (None, Some(b)) => Some(b),
            (None, None) => None,
        }
    }
}

impl<'a> Iterator for Multipart<'a> {
    type Item = Result<Part<'a>, MultipartError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.body.is_empty() {
            return None;
        }

        let mut start = find(self.body, &self.marker)?;
        start += self.marker.len();

        // `--` after the marker closes the stream.
        if self.body.len() >= start + 2
            && self.body[start] == b'-'
            && self.body[start + 1] == b'-'
        {
            self.body = &[];
            return None;
        }

        if self.body.len() >= start + 2
            && self.body[start] == b'\r'
            && self.body[start + 1] == b'\n'
        {
            start += 2;
        } else if self.body.len() > start && self.body[start] == b'\n' {
            start += 1;
        }

        let (header_end, sep_len) = match find(&self.body[start..], b"\r\n\r\n") {
            Some(idx) => (idx, 4),
            None => match find(&self.body[start..], b"\n\n") {
                Some(idx) => (idx, 2),
                None => {
                    self.body = &[];
                    return Some(Err(MultipartError::Truncated));
                }
            },
        };
        let header_slice = &self.body[start..start + header_end];
        let body_start = start + header_end + sep_len;

        let body_end = match self.next_boundary(&self.body[body_start..]) {
            Some(offset) => body_start + offset,
            None => {
                self.body = &[];
                return Some(Err(MultipartError::Truncated));
            }
        };
        let part_body = &self.body[body_start..body_end];
        self.body = &self.body[body_end..];

        let mut name = None;
        let mut filename = None;
        if let Ok(headers) = std::str::from_utf8(header_slice) {
            for line in headers.split(['\r', '\n']).filter(|l| !l.is_empty()) {
                let lower = line.to_ascii_lowercase();
                if lower.starts_with("content-disposition:") {
                    if let Some(idx) = lower.find("name=\"") {
                        let rest = &line[idx + 6..];
                        if let Some(end) = rest.find('"') {
                            name = Some(&rest[..end]);
                        }
                    }
                    if let Some(idx) = lower.find("filename=\"") {
                        let rest = &line[idx + 10..];
                        if let Some(end) = rest.find('"') {
                            filename = Some(&rest[..end]);
                        }
                    }
                }
            }
        }

        Some(Ok(Part {
            name,
            filename,
            body: part_body,
        }))
    }
}
