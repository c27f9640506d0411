//! Signal expression language.
//!
//! `RET_LAG(1,252) - RET_LAG(1,21)`, `VOL_TARGET(mom, ann_vol=0.15)` and the
//! like are tokenized, parsed with ordinary arithmetic precedence and bound
//! into a typed [`Node`] tree. Primitive names resolve through a table built
//! once per process; bare identifiers resolve to signals declared earlier in
//! the same factor.

use std::collections::HashMap;
use std::fmt;
use std::sync::OnceLock;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ExpressionError {
    #[error("expression is empty")]
    Empty,

    #[error("unexpected character '{ch}' at position {position}")]
    UnexpectedChar { ch: char, position: usize },

    #[error("invalid number '{text}' at position {position}")]
    InvalidNumber { text: String, position: usize },

    #[error("expected {expected} at position {position}, found {found}")]
    UnexpectedToken {
        expected: &'static str,
        found: String,
        position: usize,
    },

    #[error("unknown primitive {name}")]
    UnknownPrimitive { name: String },

    #[error("unknown identifier {name}")]
    UnknownIdentifier { name: String },

    #[error("signal {name} references itself")]
    SelfReference { name: String },

    #[error("signal {name} is declared later and cannot be referenced here")]
    ForwardReference { name: String },

    #[error("{primitive}: {reason}")]
    InvalidArguments {
        primitive: &'static str,
        reason: String,
    },

    #[error("expression nests deeper than {limit} levels")]
    TooDeep { limit: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Primitive {
    RetLag,
    RetD,
    Price,
    Delay,
    Delta,
    RollMean,
    RollStd,
    RollSum,
    RollMax,
    RollMin,
    TsRank,
    TsZScore,
    DecayLinear,
    Correlation,
    Covariance,
    ZScore,
    Rank,
    Demean,
    Scale,
    VolTarget,
    Abs,
    Sign,
    Log,
    Power,
    Max,
    Min,
    Product,
    Skew,
    Kurtosis,
    TsArgMax,
    TsArgMin,
    CorrelationDecay,
    DrawdownRecovery,
    RegimeVolatility,
    RegimeTrend,
}

const ALL_PRIMITIVES: [Primitive; 35] = [
    Primitive::RetLag,
    Primitive::RetD,
    Primitive::Price,
    Primitive::Delay,
    Primitive::Delta,
    Primitive::RollMean,
    Primitive::RollStd,
    Primitive::RollSum,
    Primitive::RollMax,
    Primitive::RollMin,
    Primitive::TsRank,
    Primitive::TsZScore,
    Primitive::DecayLinear,
    Primitive::Correlation,
    Primitive::Covariance,
    Primitive::ZScore,
    Primitive::Rank,
    Primitive::Demean,
    Primitive::Scale,
    Primitive::VolTarget,
    Primitive::Abs,
    Primitive::Sign,
    Primitive::Log,
    Primitive::Power,
    Primitive::Max,
    Primitive::Min,
    Primitive::Product,
    Primitive::Skew,
    Primitive::Kurtosis,
    Primitive::TsArgMax,
    Primitive::TsArgMin,
    Primitive::CorrelationDecay,
    Primitive::DrawdownRecovery,
    Primitive::RegimeVolatility,
    Primitive::RegimeTrend,
];

const ALIASES: [(&str, Primitive); 8] = [
    ("TS_DELAY", Primitive::Delay),
    ("TS_DELTA", Primitive::Delta),
    ("TS_MEAN", Primitive::RollMean),
    ("TS_STD", Primitive::RollStd),
    ("INDNEUTRALIZE", Primitive::Demean),
    ("CORR", Primitive::Correlation),
    ("SUM", Primitive::RollSum),
    ("INDCLASS_NEUTRALIZE", Primitive::Demean),
];

fn primitive_table() -> &'static HashMap<&'static str, Primitive> {
    static TABLE: OnceLock<HashMap<&'static str, Primitive>> = OnceLock::new();
    TABLE.get_or_init(|| {
        let mut table: HashMap<&'static str, Primitive> = ALL_PRIMITIVES
            .iter()
            .map(|primitive| (primitive.name(), *primitive))
            .collect();
        table.extend(ALIASES);
        table
    })
}

impl Primitive {
    pub fn lookup(name: &str) -> Option<Self> {
        primitive_table()
            .get(name.to_ascii_uppercase().as_str())
            .copied()
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::RetLag => "RET_LAG",
            Self::RetD => "RET_D",
            Self::Price => "PRICE",
            Self::Delay => "DELAY",
            Self::Delta => "DELTA",
            Self::RollMean => "ROLL_MEAN",
            Self::RollStd => "ROLL_STD",
            Self::RollSum => "ROLL_SUM",
            Self::RollMax => "ROLL_MAX",
            Self::RollMin => "ROLL_MIN",
            Self::TsRank => "TS_RANK",
            Self::TsZScore => "TS_ZSCORE",
            Self::DecayLinear => "DECAY_LINEAR",
            Self::Correlation => "CORRELATION",
            Self::Covariance => "COVARIANCE",
            Self::ZScore => "ZSCORE",
            Self::Rank => "RANK",
            Self::Demean => "DEMEAN",
            Self::Scale => "SCALE",
            Self::VolTarget => "VOL_TARGET",
            Self::Abs => "ABS",
            Self::Sign => "SIGN",
            Self::Log => "LOG",
            Self::Power => "POWER",
            Self::Max => "MAX",
            Self::Min => "MIN",
            Self::Product => "PRODUCT",
            Self::Skew => "SKEW",
            Self::Kurtosis => "KURTOSIS",
            Self::TsArgMax => "TS_ARGMAX",
            Self::TsArgMin => "TS_ARGMIN",
            Self::CorrelationDecay => "CORRELATION_DECAY",
            Self::DrawdownRecovery => "DRAWDOWN_RECOVERY",
            Self::RegimeVolatility => "REGIME_VOLATILITY",
            Self::RegimeTrend => "REGIME_TREND",
        }
    }

    /// Argument names in positional order; keyword arguments match these.
    fn slots(self) -> &'static [&'static str] {
        match self {
            Self::RetLag => &["lag", "window"],
            Self::RetD | Self::Price => &["lag"],
            Self::Delay | Self::Delta => &["x", "periods"],
            Self::RollMean
            | Self::RollStd
            | Self::RollSum
            | Self::RollMax
            | Self::RollMin
            | Self::TsRank
            | Self::TsZScore
            | Self::DecayLinear
            | Self::Product
            | Self::Skew
            | Self::Kurtosis
            | Self::TsArgMax
            | Self::TsArgMin
            | Self::DrawdownRecovery => &["x", "window"],
            Self::Correlation | Self::Covariance => &["x", "y", "window"],
            Self::CorrelationDecay => &["x", "y", "window", "decay"],
            Self::RegimeVolatility => &["x", "window", "threshold", "history"],
            Self::RegimeTrend => &["x", "short_window", "long_window"],
            Self::ZScore | Self::Rank | Self::Demean | Self::Scale => &["x"],
            Self::VolTarget => &["x", "ann_vol", "window", "using"],
            Self::Abs | Self::Sign | Self::Log => &["x"],
            Self::Power => &["x", "exponent"],
            Self::Max | Self::Min => &["x", "y"],
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
}

impl BinaryOp {
    pub fn apply(self, left: f64, right: f64) -> f64 {
        match self {
            Self::Add => left + right,
            Self::Sub => left - right,
            Self::Mul => left * right,
            Self::Div => {
                if right == 0.0 {
                    f64::NAN
                } else {
                    left / right
                }
            }
        }
    }

    fn symbol(self) -> char {
        match self {
            Self::Add => '+',
            Self::Sub => '-',
            Self::Mul => '*',
            Self::Div => '/',
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RollingStat {
    Mean,
    Std,
    Sum,
    Max,
    Min,
    Rank,
    ZScore,
    DecayLinear,
    Product,
    Skew,
    Kurtosis,
    ArgMax,
    ArgMin,
    DrawdownRecovery,
}

impl RollingStat {
    /// Periods before the current date that one output reads.
    pub fn history(self, window: usize) -> usize {
        match self {
            // change of the drawdown since the previous date
            Self::DrawdownRecovery => window,
            _ => window.saturating_sub(1),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PairStat {
    Correlation,
    Covariance,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CrossSectionOp {
    ZScore,
    Rank,
    Demean,
    Scale,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElementwiseOp {
    Abs,
    Sign,
    Log,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtremumOp {
    Max,
    Min,
}

/// Bound expression tree. Acyclic by construction: a node can only refer to
/// signals declared before the one being parsed.
#[derive(Debug, Clone, PartialEq)]
pub enum Node {
    Constant(f64),
    Signal(String),
    Negate(Box<Node>),
    Binary {
        op: BinaryOp,
        left: Box<Node>,
        right: Box<Node>,
    },
    LaggedReturn {
        lag: usize,
        window: usize,
    },
    DailyReturn {
        lag: usize,
    },
    Price {
        lag: usize,
    },
    Delay {
        input: Box<Node>,
        periods: usize,
    },
    Delta {
        input: Box<Node>,
        periods: usize,
    },
    Rolling {
        stat: RollingStat,
        input: Box<Node>,
        window: usize,
    },
    Pairwise {
        stat: PairStat,
        left: Box<Node>,
        right: Box<Node>,
        window: usize,
    },
    CrossSection {
        op: CrossSectionOp,
        input: Box<Node>,
    },
    VolTarget {
        input: Option<Box<Node>>,
        ann_vol: f64,
        window: usize,
        using: Option<Box<Node>>,
    },
    Elementwise {
        op: ElementwiseOp,
        input: Box<Node>,
    },
    Power {
        input: Box<Node>,
        exponent: f64,
    },
    Extremum {
        op: ExtremumOp,
        left: Box<Node>,
        right: Box<Node>,
    },
    /// Rolling correlation with weights falling by `decay` per period of age.
    DecayedCorrelation {
        left: Box<Node>,
        right: Box<Node>,
        window: usize,
        decay: f64,
    },
    /// +1 when trailing volatility sits above its recent median by more than
    /// `threshold`, -1 when below by more than that, else 0.
    VolatilityRegime {
        input: Box<Node>,
        window: usize,
        threshold: f64,
        history: usize,
    },
    /// Sign of the short moving average minus the long one.
    TrendRegime {
        input: Box<Node>,
        short: usize,
        long: usize,
    },
}

/// Implicit lag of the return series read by `VOL_TARGET` when no `using`
/// series is supplied.
pub const VOL_TARGET_RETURN_LAG: usize = 1;
pub const VOL_TARGET_DEFAULT_WINDOW: usize = 21;

const DRAWDOWN_DEFAULT_WINDOW: usize = 252;
const CORRELATION_DEFAULT_DECAY: f64 = 0.5;
const REGIME_DEFAULT_VOL_WINDOW: usize = 21;
const REGIME_DEFAULT_THRESHOLD: f64 = 0.2;
const REGIME_DEFAULT_HISTORY: usize = 252;
const REGIME_DEFAULT_SHORT_WINDOW: usize = 21;
const REGIME_DEFAULT_LONG_WINDOW: usize = 63;

impl Node {
    pub fn children(&self) -> Vec<&Node> {
        match self {
            Node::Constant(_)
            | Node::Signal(_)
            | Node::LaggedReturn { .. }
            | Node::DailyReturn { .. }
            | Node::Price { .. } => Vec::new(),
            Node::Negate(input)
            | Node::Delay { input, .. }
            | Node::Delta { input, .. }
            | Node::Rolling { input, .. }
            | Node::CrossSection { input, .. }
            | Node::Elementwise { input, .. }
            | Node::Power { input, .. }
            | Node::VolatilityRegime { input, .. }
            | Node::TrendRegime { input, .. } => vec![input.as_ref()],
            Node::Binary { left, right, .. }
            | Node::Pairwise { left, right, .. }
            | Node::Extremum { left, right, .. }
            | Node::DecayedCorrelation { left, right, .. } => vec![left.as_ref(), right.as_ref()],
            Node::VolTarget { input, using, .. } => input
                .iter()
                .chain(using.iter())
                .map(|node| node.as_ref())
                .collect(),
        }
    }

    /// Number of primitive applications in the tree.
    pub fn call_count(&self) -> usize {
        let own = match self {
            Node::Constant(_) | Node::Signal(_) | Node::Negate(_) | Node::Binary { .. } => 0,
            _ => 1,
        };
        own + self
            .children()
            .into_iter()
            .map(Node::call_count)
            .sum::<usize>()
    }

    pub fn depth(&self) -> usize {
        1 + self
            .children()
            .into_iter()
            .map(Node::depth)
            .max()
            .unwrap_or(0)
    }

    /// Ids of the signals this tree reads.
    pub fn signal_refs(&self) -> Vec<&str> {
        let mut refs = Vec::new();
        self.collect_refs(&mut refs);
        refs
    }

    fn collect_refs<'a>(&'a self, refs: &mut Vec<&'a str>) {
        if let Node::Signal(id) = self {
            if !refs.contains(&id.as_str()) {
                refs.push(id.as_str());
            }
        }
        for child in self.children() {
            child.collect_refs(refs);
        }
    }
}

impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Node::Constant(value) => write!(f, "{}", value),
            Node::Signal(id) => write!(f, "{}", id),
            Node::Negate(input) => write!(f, "-({})", input),
            Node::Binary { op, left, right } => write!(f, "({} {} {})", left, op.symbol(), right),
            Node::LaggedReturn { lag, window } => write!(f, "RET_LAG({}, {})", lag, window),
            Node::DailyReturn { lag } => write!(f, "RET_D({})", lag),
            Node::Price { lag } => write!(f, "PRICE({})", lag),
            Node::Delay { input, periods } => write!(f, "DELAY({}, {})", input, periods),
            Node::Delta { input, periods } => write!(f, "DELTA({}, {})", input, periods),
            Node::Rolling {
                stat,
                input,
                window,
            } => write!(f, "{:?}({}, {})", stat, input, window),
            Node::Pairwise {
                stat,
                left,
                right,
                window,
            } => write!(f, "{:?}({}, {}, {})", stat, left, right, window),
            Node::CrossSection { op, input } => write!(f, "{:?}({})", op, input),
            Node::VolTarget {
                input,
                ann_vol,
                window,
                using,
            } => {
                write!(f, "VOL_TARGET(")?;
                if let Some(input) = input {
                    write!(f, "{}, ", input)?;
                }
                write!(f, "ann_vol={}, window={}", ann_vol, window)?;
                if let Some(using) = using {
                    write!(f, ", using={}", using)?;
                }
                write!(f, ")")
            }
            Node::Elementwise { op, input } => write!(f, "{:?}({})", op, input),
            Node::Power { input, exponent } => write!(f, "POWER({}, {})", input, exponent),
            Node::Extremum { op, left, right } => write!(f, "{:?}({}, {})", op, left, right),
            Node::DecayedCorrelation {
                left,
                right,
                window,
                decay,
            } => write!(
                f,
                "CORRELATION_DECAY({}, {}, {}, decay={})",
                left, right, window, decay
            ),
            Node::VolatilityRegime {
                input,
                window,
                threshold,
                history,
            } => write!(
                f,
                "REGIME_VOLATILITY({}, window={}, threshold={}, history={})",
                input, window, threshold, history
            ),
            Node::TrendRegime { input, short, long } => {
                write!(f, "REGIME_TREND({}, {}, {})", input, short, long)
            }
        }
    }
}

/// Signal ids visible to an expression: everything declared, plus which one
/// is being parsed.
#[derive(Debug, Clone, Copy)]
pub struct SignalScope<'a> {
    pub declared: &'a [String],
    pub current: usize,
}

impl<'a> SignalScope<'a> {
    pub fn empty() -> SignalScope<'static> {
        SignalScope {
            declared: &[],
            current: 0,
        }
    }

    fn resolve(&self, name: &str) -> Result<Node, ExpressionError> {
        let position = self.declared.iter().position(|id| id == name);
        match position {
            Some(index) if index < self.current => Ok(Node::Signal(name.to_string())),
            Some(index) if index == self.current => Err(ExpressionError::SelfReference {
                name: name.to_string(),
            }),
            Some(_) => Err(ExpressionError::ForwardReference {
                name: name.to_string(),
            }),
            None => Err(ExpressionError::UnknownIdentifier {
                name: name.to_string(),
            }),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum TokenKind {
    Ident(String),
    Number(f64),
    Str(String),
    LParen,
    RParen,
    Comma,
    Equals,
    Plus,
    Minus,
    Star,
    Slash,
    Eof,
}

impl fmt::Display for TokenKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TokenKind::Ident(name) => write!(f, "identifier {}", name),
            TokenKind::Number(value) => write!(f, "number {}", value),
            TokenKind::Str(text) => write!(f, "string '{}'", text),
            TokenKind::LParen => write!(f, "'('"),
            TokenKind::RParen => write!(f, "')'"),
            TokenKind::Comma => write!(f, "','"),
            TokenKind::Equals => write!(f, "'='"),
            TokenKind::Plus => write!(f, "'+'"),
            TokenKind::Minus => write!(f, "'-'"),
            TokenKind::Star => write!(f, "'*'"),
            TokenKind::Slash => write!(f, "'/'"),
            TokenKind::Eof => write!(f, "end of expression"),
        }
    }
}

#[derive(Debug, Clone)]
struct Token {
    kind: TokenKind,
    position: usize,
}

fn tokenize(input: &str) -> Result<Vec<Token>, ExpressionError> {
    let chars: Vec<char> = input.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let ch = chars[i];
        let start = i;
        if ch.is_whitespace() {
            i += 1;
            continue;
        }

        let kind = match ch {
            '(' => TokenKind::LParen,
            ')' => TokenKind::RParen,
            ',' => TokenKind::Comma,
            '=' => TokenKind::Equals,
            '+' => TokenKind::Plus,
            '-' => TokenKind::Minus,
            '*' => TokenKind::Star,
            '/' => TokenKind::Slash,
            '\'' | '"' => {
                let quote = ch;
                let mut j = i + 1;
                while j < chars.len() && chars[j] != quote {
                    j += 1;
                }
                if j >= chars.len() {
                    return Err(ExpressionError::UnexpectedChar {
                        ch: quote,
                        position: start,
                    });
                }
                let text: String = chars[i + 1..j].iter().collect();
                i = j + 1;
                tokens.push(Token {
                    kind: TokenKind::Str(text.trim().to_string()),
                    position: start,
                });
                continue;
            }
            c if c.is_ascii_digit() || c == '.' => {
                let mut j = i;
                while j < chars.len() && (chars[j].is_ascii_digit() || chars[j] == '.') {
                    j += 1;
                }
                if j < chars.len() && (chars[j] == 'e' || chars[j] == 'E') {
                    let mut k = j + 1;
                    if k < chars.len() && (chars[k] == '+' || chars[k] == '-') {
                        k += 1;
                    }
                    if k < chars.len() && chars[k].is_ascii_digit() {
                        while k < chars.len() && chars[k].is_ascii_digit() {
                            k += 1;
                        }
                        j = k;
                    }
                }
                let text: String = chars[i..j].iter().collect();
                let value = text
                    .parse::<f64>()
                    .map_err(|_| ExpressionError::InvalidNumber {
                        text: text.clone(),
                        position: start,
                    })?;
                i = j;
                tokens.push(Token {
                    kind: TokenKind::Number(value),
                    position: start,
                });
                continue;
            }
            c if c.is_ascii_alphabetic() || c == '_' => {
                let mut j = i;
                while j < chars.len() && (chars[j].is_ascii_alphanumeric() || chars[j] == '_') {
                    j += 1;
                }
                let text: String = chars[i..j].iter().collect();
                i = j;
                tokens.push(Token {
                    kind: TokenKind::Ident(text),
                    position: start,
                });
                continue;
            }
            other => {
                return Err(ExpressionError::UnexpectedChar {
                    ch: other,
                    position: start,
                })
            }
        };
        tokens.push(Token {
            kind,
            position: start,
        });
        i += 1;
    }

    tokens.push(Token {
        kind: TokenKind::Eof,
        position: chars.len(),
    });
    Ok(tokens)
}

struct Argument {
    name: Option<String>,
    value: Node,
}

/// Bound on nested parentheses, calls, unary signs and operator chains.
pub const MAX_NESTING: usize = 256;

/// Largest integer argument accepted for lags, windows and periods.
pub const MAX_INTEGER_ARGUMENT: f64 = u32::MAX as f64;

struct Parser<'a> {
    tokens: Vec<Token>,
    pos: usize,
    depth: usize,
    scope: SignalScope<'a>,
}

impl<'a> Parser<'a> {
    fn peek(&self) -> &TokenKind {
        &self.tokens[self.pos.min(self.tokens.len() - 1)].kind
    }

    fn peek_at(&self, offset: usize) -> &TokenKind {
        &self.tokens[(self.pos + offset).min(self.tokens.len() - 1)].kind
    }

    fn position(&self) -> usize {
        self.tokens[self.pos.min(self.tokens.len() - 1)].position
    }

    fn advance(&mut self) -> TokenKind {
        let kind = self.peek().clone();
        if self.pos < self.tokens.len() - 1 {
            self.pos += 1;
        }
        kind
    }

    fn unexpected(&self, expected: &'static str) -> ExpressionError {
        ExpressionError::UnexpectedToken {
            expected,
            found: self.peek().to_string(),
            position: self.position(),
        }
    }

    fn expect(&mut self, kind: TokenKind, expected: &'static str) -> Result<(), ExpressionError> {
        if *self.peek() == kind {
            self.advance();
            Ok(())
        } else {
            Err(self.unexpected(expected))
        }
    }

    fn descend(&mut self) -> Result<(), ExpressionError> {
        self.depth += 1;
        if self.depth > MAX_NESTING {
            return Err(ExpressionError::TooDeep { limit: MAX_NESTING });
        }
        Ok(())
    }

    /// Runs `parse` and restores the nesting level it started from.
    fn nested(
        &mut self,
        parse: fn(&mut Self) -> Result<Node, ExpressionError>,
    ) -> Result<Node, ExpressionError> {
        let entry = self.depth;
        let node = parse(self);
        self.depth = entry;
        node
    }

    fn expression(&mut self) -> Result<Node, ExpressionError> {
        self.nested(Self::sum)
    }

    fn sum(&mut self) -> Result<Node, ExpressionError> {
        self.descend()?;
        let mut node = self.term()?;
        loop {
            let op = match self.peek() {
                TokenKind::Plus => BinaryOp::Add,
                TokenKind::Minus => BinaryOp::Sub,
                _ => return Ok(node),
            };
            self.advance();
            self.descend()?;
            let right = self.term()?;
            node = Node::Binary {
                op,
                left: Box::new(node),
                right: Box::new(right),
            };
        }
    }

    fn term(&mut self) -> Result<Node, ExpressionError> {
        self.nested(Self::product)
    }

    fn product(&mut self) -> Result<Node, ExpressionError> {
        let mut node = self.unary()?;
        loop {
            let op = match self.peek() {
                TokenKind::Star => BinaryOp::Mul,
                TokenKind::Slash => BinaryOp::Div,
                _ => return Ok(node),
            };
            self.advance();
            self.descend()?;
            let right = self.unary()?;
            node = Node::Binary {
                op,
                left: Box::new(node),
                right: Box::new(right),
            };
        }
    }

    fn unary(&mut self) -> Result<Node, ExpressionError> {
        match self.peek() {
            TokenKind::Minus => {
                self.advance();
                self.descend()?;
                Ok(match self.unary()? {
                    Node::Constant(value) => Node::Constant(-value),
                    other => Node::Negate(Box::new(other)),
                })
            }
            TokenKind::Plus => {
                self.advance();
                self.descend()?;
                self.unary()
            }
            _ => self.primary(),
        }
    }

    fn primary(&mut self) -> Result<Node, ExpressionError> {
        let kind = self.peek().clone();
        match kind {
            TokenKind::Number(value) => {
                self.advance();
                Ok(Node::Constant(value))
            }
            TokenKind::Str(name) => {
                self.advance();
                self.scope.resolve(&name)
            }
            TokenKind::LParen => {
                self.advance();
                let node = self.expression()?;
                self.expect(TokenKind::RParen, "')'")?;
                Ok(node)
            }
            TokenKind::Ident(name) => {
                self.advance();
                if *self.peek() == TokenKind::LParen {
                    self.advance();
                    let primitive = Primitive::lookup(&name)
                        .ok_or(ExpressionError::UnknownPrimitive { name })?;
                    let args = self.arguments()?;
                    bind(primitive, args)
                } else if let Ok(node) = self.scope.resolve(&name) {
                    Ok(node)
                } else {
                    match Primitive::lookup(&name) {
                        Some(primitive @ (Primitive::RetD | Primitive::Price)) => {
                            bind(primitive, Vec::new())
                        }
                        _ => self.scope.resolve(&name),
                    }
                }
            }
            _ => Err(self.unexpected("a number, identifier or '('")),
        }
    }

    fn arguments(&mut self) -> Result<Vec<Argument>, ExpressionError> {
        let mut args = Vec::new();
        if *self.peek() == TokenKind::RParen {
            self.advance();
            return Ok(args);
        }
        loop {
            let is_keyword = *self.peek_at(1) == TokenKind::Equals;
            let name = match self.peek().clone() {
                TokenKind::Ident(name) if is_keyword => {
                    self.advance();
                    self.advance();
                    Some(name)
                }
                _ => None,
            };
            let value = self.expression()?;
            args.push(Argument { name, value });
            match self.peek() {
                TokenKind::Comma => {
                    self.advance();
                }
                TokenKind::RParen => {
                    self.advance();
                    return Ok(args);
                }
                _ => return Err(self.unexpected("',' or ')'")),
            }
        }
    }
}

struct BoundArgs {
    primitive: Primitive,
    slots: Vec<Option<Node>>,
}

impl BoundArgs {
    fn invalid(&self, reason: String) -> ExpressionError {
        ExpressionError::InvalidArguments {
            primitive: self.primitive.name(),
            reason,
        }
    }

    fn slot_name(&self, index: usize) -> &'static str {
        self.primitive.slots()[index]
    }

    fn operand(&mut self, index: usize) -> Result<Box<Node>, ExpressionError> {
        match self.slots[index].take() {
            Some(node) => Ok(Box::new(node)),
            None => Err(self.invalid(format!("missing argument {}", self.slot_name(index)))),
        }
    }

    fn optional_operand(&mut self, index: usize) -> Option<Box<Node>> {
        self.slots[index].take().map(Box::new)
    }

    fn number(&mut self, index: usize, default: Option<f64>) -> Result<f64, ExpressionError> {
        match self.slots[index].take() {
            Some(Node::Constant(value)) if value.is_finite() => Ok(value),
            Some(_) => Err(self.invalid(format!(
                "{} must be a numeric literal",
                self.slot_name(index)
            ))),
            None => default
                .ok_or_else(|| self.invalid(format!("missing argument {}", self.slot_name(index)))),
        }
    }

    fn integer(
        &mut self,
        index: usize,
        default: Option<usize>,
        min: usize,
    ) -> Result<usize, ExpressionError> {
        let name = self.slot_name(index);
        let value = match self.slots[index].take() {
            Some(Node::Constant(value)) => {
                if !value.is_finite() || value.fract() != 0.0 || value < 0.0 {
                    return Err(self.invalid(format!(
                        "{} must be a non-negative integer (value: {})",
                        name, value
                    )));
                }
                if value > MAX_INTEGER_ARGUMENT {
                    return Err(self.invalid(format!(
                        "{} must be at most {} (value: {})",
                        name, MAX_INTEGER_ARGUMENT, value
                    )));
                }
                value as usize
            }
            Some(_) => {
                return Err(self.invalid(format!("{} must be an integer literal", name)));
            }
            None => default.ok_or_else(|| self.invalid(format!("missing argument {}", name)))?,
        };
        if value < min {
            return Err(self.invalid(format!(
                "{} must be >= {} (value: {})",
                name, min, value
            )));
        }
        Ok(value)
    }
}

fn bind(primitive: Primitive, args: Vec<Argument>) -> Result<Node, ExpressionError> {
    let names = primitive.slots();
    let mut bound = BoundArgs {
        primitive,
        slots: (0..names.len()).map(|_| None).collect(),
    };
    let mut next_positional = 0;
    let mut seen_keyword = false;

    for arg in args {
        let index = match arg.name {
            None => {
                if seen_keyword {
                    return Err(bound.invalid(
                        "positional argument follows keyword argument".to_string(),
                    ));
                }
                if next_positional >= names.len() {
                    return Err(bound.invalid(format!(
                        "takes at most {} arguments",
                        names.len()
                    )));
                }
                next_positional += 1;
                next_positional - 1
            }
            Some(name) => {
                seen_keyword = true;
                names
                    .iter()
                    .position(|slot| slot.eq_ignore_ascii_case(&name))
                    .ok_or_else(|| bound.invalid(format!("unknown argument {}", name)))?
            }
        };
        if bound.slots[index].is_some() {
            return Err(bound.invalid(format!("argument {} given twice", names[index])));
        }
        bound.slots[index] = Some(arg.value);
    }

    let rolling = |stat: RollingStat,
                   min_window: usize,
                   bound: &mut BoundArgs|
     -> Result<Node, ExpressionError> {
        let input = bound.operand(0)?;
        let window = bound.integer(1, None, min_window)?;
        Ok(Node::Rolling {
            stat,
            input,
            window,
        })
    };
    let pairwise = |stat: PairStat, bound: &mut BoundArgs| -> Result<Node, ExpressionError> {
        let left = bound.operand(0)?;
        let right = bound.operand(1)?;
        let window = bound.integer(2, None, 2)?;
        Ok(Node::Pairwise {
            stat,
            left,
            right,
            window,
        })
    };
    let cross_section =
        |op: CrossSectionOp, bound: &mut BoundArgs| -> Result<Node, ExpressionError> {
        Ok(Node::CrossSection {
            op,
            input: bound.operand(0)?,
        })
    };
    let elementwise =
        |op: ElementwiseOp, bound: &mut BoundArgs| -> Result<Node, ExpressionError> {
        Ok(Node::Elementwise {
            op,
            input: bound.operand(0)?,
        })
    };
    let extremum =
        |op: ExtremumOp, bound: &mut BoundArgs| -> Result<Node, ExpressionError> {
        Ok(Node::Extremum {
            op,
            left: bound.operand(0)?,
            right: bound.operand(1)?,
        })
    };

    let b = &mut bound;
    match primitive {
        Primitive::RetLag => {
            let lag = b.integer(0, None, 0)?;
            let window = b.integer(1, None, 1)?;
            Ok(Node::LaggedReturn { lag, window })
        }
        Primitive::RetD => Ok(Node::DailyReturn {
            lag: b.integer(0, Some(0), 0)?,
        }),
        Primitive::Price => Ok(Node::Price {
            lag: b.integer(0, Some(0), 0)?,
        }),
        Primitive::Delay => {
            let input = b.operand(0)?;
            let periods = b.integer(1, None, 0)?;
            Ok(Node::Delay { input, periods })
        }
        Primitive::Delta => {
            let input = b.operand(0)?;
            let periods = b.integer(1, None, 1)?;
            Ok(Node::Delta { input, periods })
        }
        Primitive::RollMean => rolling(RollingStat::Mean, 1, b),
        Primitive::RollStd => rolling(RollingStat::Std, 2, b),
        Primitive::RollSum => rolling(RollingStat::Sum, 1, b),
        Primitive::RollMax => rolling(RollingStat::Max, 1, b),
        Primitive::RollMin => rolling(RollingStat::Min, 1, b),
        Primitive::TsRank => rolling(RollingStat::Rank, 2, b),
        Primitive::TsZScore => rolling(RollingStat::ZScore, 2, b),
        Primitive::DecayLinear => rolling(RollingStat::DecayLinear, 1, b),
        Primitive::Correlation => pairwise(PairStat::Correlation, b),
        Primitive::Covariance => pairwise(PairStat::Covariance, b),
        Primitive::ZScore => cross_section(CrossSectionOp::ZScore, b),
        Primitive::Rank => cross_section(CrossSectionOp::Rank, b),
        Primitive::Demean => cross_section(CrossSectionOp::Demean, b),
        Primitive::Scale => cross_section(CrossSectionOp::Scale, b),
        Primitive::VolTarget => {
            // VOL_TARGET(0.15) targets a unit position.
            if b.slots[1].is_none() && matches!(b.slots[0], Some(Node::Constant(_))) {
                b.slots[1] = b.slots[0].take();
            }
            let input = b.optional_operand(0);
            let ann_vol = b.number(1, None)?;
            if ann_vol <= 0.0 {
                return Err(b.invalid(format!("ann_vol must be > 0 (value: {})", ann_vol)));
            }
            let window = b.integer(2, Some(VOL_TARGET_DEFAULT_WINDOW), 2)?;
            let using = b.optional_operand(3);
            Ok(Node::VolTarget {
                input,
                ann_vol,
                window,
                using,
            })
        }
        Primitive::Abs => elementwise(ElementwiseOp::Abs, b),
        Primitive::Sign => elementwise(ElementwiseOp::Sign, b),
        Primitive::Log => elementwise(ElementwiseOp::Log, b),
        Primitive::Power => {
            let input = b.operand(0)?;
            let exponent = b.number(1, None)?;
            Ok(Node::Power { input, exponent })
        }
        Primitive::Max => extremum(ExtremumOp::Max, b),
        Primitive::Min => extremum(ExtremumOp::Min, b),
        Primitive::Product => rolling(RollingStat::Product, 1, b),
        Primitive::Skew => rolling(RollingStat::Skew, 3, b),
        Primitive::Kurtosis => rolling(RollingStat::Kurtosis, 4, b),
        Primitive::TsArgMax => rolling(RollingStat::ArgMax, 1, b),
        Primitive::TsArgMin => rolling(RollingStat::ArgMin, 1, b),
        Primitive::DrawdownRecovery => {
            let input = b.operand(0)?;
            let window = b.integer(1, Some(DRAWDOWN_DEFAULT_WINDOW), 1)?;
            Ok(Node::Rolling {
                stat: RollingStat::DrawdownRecovery,
                input,
                window,
            })
        }
        Primitive::CorrelationDecay => {
            let left = b.operand(0)?;
            let right = b.operand(1)?;
            let window = b.integer(2, None, 2)?;
            let decay = b.number(3, Some(CORRELATION_DEFAULT_DECAY))?;
            if decay <= 0.0 || decay > 1.0 {
                return Err(b.invalid(format!("decay must be in (0, 1] (value: {})", decay)));
            }
            Ok(Node::DecayedCorrelation {
                left,
                right,
                window,
                decay,
            })
        }
        Primitive::RegimeVolatility => {
            let input = b.operand(0)?;
            let window = b.integer(1, Some(REGIME_DEFAULT_VOL_WINDOW), 2)?;
            let threshold = b.number(2, Some(REGIME_DEFAULT_THRESHOLD))?;
            if !(0.0..1.0).contains(&threshold) {
                return Err(b.invalid(format!(
                    "threshold must be in [0, 1) (value: {})",
                    threshold
                )));
            }
            let history = b.integer(3, Some(REGIME_DEFAULT_HISTORY), 2)?;
            Ok(Node::VolatilityRegime {
                input,
                window,
                threshold,
                history,
            })
        }
        Primitive::RegimeTrend => {
            let input = b.operand(0)?;
            let short = b.integer(1, Some(REGIME_DEFAULT_SHORT_WINDOW), 1)?;
            let long = b.integer(2, Some(REGIME_DEFAULT_LONG_WINDOW), 2)?;
            if short >= long {
                return Err(b.invalid(format!(
                    "short_window must be below long_window ({} >= {})",
                    short, long
                )));
            }
            Ok(Node::TrendRegime { input, short, long })
        }
    }
}

/// Parses one signal expression in the given scope.
pub fn parse_expression(text: &str, scope: SignalScope<'_>) -> Result<Node, ExpressionError> {
    let tokens = tokenize(text)?;
    if tokens.len() == 1 {
        return Err(ExpressionError::Empty);
    }
    let mut parser = Parser {
        tokens,
        pos: 0,
        depth: 0,
        scope,
    };
    let node = parser.expression()?;
    if *parser.peek() != TokenKind::Eof {
        return Err(parser.unexpected("an operator or end of expression"));
    }
    Ok(node)
}
