#[derive(Debug, Copy, Clone)]
pub struct TestCase {
    name: &'static str,
    group: TestGroup,
    payload: Payload,
}

impl TestCase {
    pub fn new(name: &'static str, group: TestGroup, payload: Payload) -> Self {
        Self { name, group, payload }
    }

    pub fn small(name: &'static str, payload: Payload) -> Self {
        Self::new(name, TestGroup::Small, payload)
    }

    pub fn normal(name: &'static str, payload: Payload) -> Self {
        Self::new(name, TestGroup::Normal, payload)
    }

    pub fn large(name: &'static str, payload: Payload) -> Self {
        Self::new(name, TestGroup::Large, payload)
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn group(&self) -> TestGroup {
        self.group
    }

    pub fn payload(&self) -> &Payload {
        &self.payload
    }
}

/// A body of `total` bytes delivered in chunks of `chunk` bytes.
#[derive(Debug, Copy, Clone)]
pub struct Payload {
    total: usize,
    chunk: usize,
}

impl Payload {
    pub const fn new(total: usize, chunk: usize) -> Self {
        Self { total, chunk }
    }

    pub fn total(&self) -> usize {
        self.total
    }

    pub fn chunk(&self) -> usize {
        self.chunk
    }

    pub fn content(&self) -> Vec<u8> {
        (0..=250u8).cycle().take(self.total).collect()
    }

    pub fn chunks(&self) -> Vec<Vec<u8>> {
        self.content().chunks(self.chunk).map(<[u8]>::to_vec).collect()
    }
}

#[derive(Clone, Copy, Debug)]
pub enum TestGroup {
    Small,
    Normal,
    Large,
}
