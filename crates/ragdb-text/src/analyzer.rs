use tantivy::tokenizer::{
	Language, LowerCaser, RemoveLongFilter, SimpleTokenizer, Stemmer, StopWordFilter, TextAnalyzer, TokenStream,
};

const STOP_WORDS: &[&str] = &[
	"a","an","and","are","as","at","be","by","for","from","has","he","in","is","it","its","of","on","that","the","to","was","will","with","or","but","not","this","these","they","them","their","there","then","than","so","if","when","where","why","how","what","which","who","whom","whose","can","could","should","would","may","might","must","shall","do","does","did","have","had","having",
];

/// Tokenizer shared by indexing and querying so both sides agree on terms.
#[derive(Clone)]
pub struct Analyzer {
	inner: TextAnalyzer,
}

impl Analyzer {
	pub fn new(stemming: bool) -> Self {
		let builder = TextAnalyzer::builder(SimpleTokenizer::default())
			.filter(RemoveLongFilter::limit(40))
			.filter(LowerCaser)
			.filter(StopWordFilter::remove(STOP_WORDS.iter().map(|s| s.to_string())));
		let inner = if stemming { builder.filter(Stemmer::new(Language::English)).build() } else { builder.build() };
		Self { inner }
	}

	pub fn tokens(&self, text: &str) -> Vec<String> {
		// token_stream needs &mut; the clone is a boxed tokenizer copy.
		let mut analyzer = self.inner.clone();
		let mut stream = analyzer.token_stream(text);
		let mut out = Vec::new();
		while stream.advance() {
			out.push(stream.token().text.clone());
		}
		out
	}
}

impl Default for Analyzer {
	fn default() -> Self { Self::new(false) }
}
